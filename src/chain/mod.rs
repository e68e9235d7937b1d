//! Chain state, fork choice, and the supply schedule

pub mod orphans;
pub mod reorg;
pub mod state;
pub mod supply;

pub use state::{BlockOutcome, ChainState, ReorgEvent, TipInfo};
pub use supply::block_reward;
