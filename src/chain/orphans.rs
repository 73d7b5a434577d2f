// Buffer for blocks whose parent is not yet known
//
// Orphans are keyed by hash and indexed by parent hash so that a newly
// connected block can pull in its waiting children. The buffer is bounded in
// size and age, and every missing ancestor carries a backfill request that is
// retried a fixed number of times before the waiting blocks are dropped.

use crate::config::{BLOCK_REQUEST_RETRY_COUNT, BLOCK_REQUEST_RETRY_INTERVAL, MAX_ORPHANS, ORPHAN_TTL};
use crate::core::{Block, Hash256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct OrphanEntry {
    block: Arc<Block>,
    received: Instant,
}

struct BlockRequest {
    last_sent: Instant,
    attempts: u32,
}

pub struct OrphanPool {
    blocks: HashMap<Hash256, OrphanEntry>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    requests: HashMap<Hash256, BlockRequest>,
    max_orphans: usize,
    ttl: Duration,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::with_limits(MAX_ORPHANS, ORPHAN_TTL)
    }

    pub fn with_limits(max_orphans: usize, ttl: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            requests: HashMap::new(),
            max_orphans,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Buffer a block and return the ancestor that has to be fetched
    pub fn insert(&mut self, block: Arc<Block>, now: Instant) -> Hash256 {
        let hash = block.hash();
        if !self.blocks.contains_key(&hash) {
            while self.blocks.len() >= self.max_orphans {
                if !self.evict_oldest() {
                    break;
                }
            }
            self.by_parent
                .entry(*block.prev_hash())
                .or_default()
                .push(hash);
            self.blocks.insert(hash, OrphanEntry { block, received: now });
            // It was the missing ancestor of earlier orphans; its own parent is missing now
            self.requests.remove(&hash);
        }

        let missing = self.missing_ancestor(&hash);
        self.requests.entry(missing).or_insert(BlockRequest {
            last_sent: now,
            attempts: 1,
        });
        missing
    }

    /// Walk up through buffered orphans to the first unknown parent
    pub fn missing_ancestor(&self, hash: &Hash256) -> Hash256 {
        let mut current = *hash;
        while let Some(entry) = self.blocks.get(&current) {
            current = *entry.block.prev_hash();
        }
        current
    }

    /// Remove and return the orphans waiting on `parent`, oldest first
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Arc<Block>> {
        self.requests.remove(parent);
        let Some(hashes) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut children: Vec<OrphanEntry> = hashes
            .iter()
            .filter_map(|h| self.blocks.remove(h))
            .collect();
        children.sort_by_key(|entry| entry.received);
        children.into_iter().map(|entry| entry.block).collect()
    }

    /// Drop a block and every buffered descendant; returns how many were dropped
    pub fn remove_subtree(&mut self, hash: &Hash256) -> usize {
        let mut removed = 0;
        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.blocks.remove(&current) {
                removed += 1;
                if let Some(siblings) = self.by_parent.get_mut(entry.block.prev_hash()) {
                    siblings.retain(|h| *h != current);
                    if siblings.is_empty() {
                        self.by_parent.remove(entry.block.prev_hash());
                    }
                }
            }
            if let Some(children) = self.by_parent.remove(&current) {
                stack.extend(children);
            }
        }
        removed
    }

    /// Drop everything waiting on `missing`
    fn abandon(&mut self, missing: &Hash256) -> usize {
        self.requests.remove(missing);
        let children = self.by_parent.get(missing).cloned().unwrap_or_default();
        children.iter().map(|child| self.remove_subtree(child)).sum()
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .blocks
            .iter()
            .min_by_key(|(_, entry)| entry.received)
            .map(|(hash, _)| *hash);
        match oldest {
            Some(hash) => {
                log::debug!("Orphan buffer full, evicting {}", hash.short());
                self.remove_subtree(&hash);
                true
            }
            None => false,
        }
    }

    /// Drop orphans older than the TTL
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let stale: Vec<Hash256> = self
            .blocks
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.received) > ttl)
            .map(|(hash, _)| *hash)
            .collect();
        let removed = stale.iter().map(|hash| self.remove_subtree(hash)).sum();

        let blocks = &self.blocks;
        let by_parent = &self.by_parent;
        self.requests.retain(|missing, _| {
            by_parent
                .get(missing)
                .is_some_and(|children| children.iter().any(|c| blocks.contains_key(c)))
        });
        removed
    }

    /// Missing ancestors whose request should be sent again now.
    /// Requests that ran out of attempts drop their waiting orphans.
    pub fn due_requests(&mut self, now: Instant) -> Vec<Hash256> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for (missing, request) in self.requests.iter_mut() {
            if now.saturating_duration_since(request.last_sent) < BLOCK_REQUEST_RETRY_INTERVAL {
                continue;
            }
            if request.attempts >= BLOCK_REQUEST_RETRY_COUNT {
                exhausted.push(*missing);
            } else {
                request.attempts += 1;
                request.last_sent = now;
                due.push(*missing);
            }
        }

        for missing in exhausted {
            let dropped = self.abandon(&missing);
            log::info!(
                "Giving up on block {} after {} requests, dropped {} orphans",
                missing.short(),
                BLOCK_REQUEST_RETRY_COUNT,
                dropped
            );
        }
        due
    }
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}
