// Merkle commitment over transaction ids
//
// Leaves are combined pairwise with hash256(left || right). A level with an
// odd number of nodes pairs its last node with itself. The root of an empty
// list is the zero hash, and a single leaf is its own root.

use crate::core::{Hash256, hash256_pair};

/// Inclusion proof: the leaf position plus one sibling per tree level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub index: usize,
    pub siblings: Vec<Hash256>,
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash256_pair(left, right)
        })
        .collect()
}

/// Compute the Merkle root of an ordered list of leaves
pub fn build_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::zero();
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Build an inclusion proof for `leaves[index]`
pub fn build_proof(leaves: &[Hash256], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut siblings = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;
    while level.len() > 1 {
        let sibling = if position % 2 == 0 {
            *level.get(position + 1).unwrap_or(&level[position])
        } else {
            level[position - 1]
        };
        siblings.push(sibling);
        level = next_level(&level);
        position /= 2;
    }

    Some(MerkleProof { index, siblings })
}

/// Check that `leaf` sits at `proof.index` under `root`
pub fn verify_proof(root: &Hash256, leaf: &Hash256, proof: &MerkleProof) -> bool {
    let mut current = *leaf;
    let mut position = proof.index;
    for sibling in &proof.siblings {
        current = if position % 2 == 0 {
            hash256_pair(&current, sibling)
        } else {
            hash256_pair(sibling, &current)
        };
        position /= 2;
    }
    position == 0 && current == *root
}
