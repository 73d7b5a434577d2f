// Chain state: block tree, derived ledger and pending transactions

mod ledger;
mod orphans;
mod mempool;
pub mod builder;
mod handle;

pub use ledger::{Account, BlockDelta, LedgerChanges, LedgerSandbox, LedgerState};
pub use orphans::OrphanPool;
pub use mempool::{Mempool, TxRejection};
pub use builder::{AcceptResult, BlockEntry, ChainBuilder, Reorg, Submission};
pub use handle::{BlockId, ChainHandle, ChainState, TipInfo};
