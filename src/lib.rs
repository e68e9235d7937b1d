// Core consensus modules
pub mod amount;
pub mod block;
pub mod canonical;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod mempool;
pub mod merkle;
pub mod storage;
pub mod tx;
pub mod utxo;

// Re-export main types for easy access
pub use amount::{Amount, COIN, MAX_SUPPLY};
pub use block::{Block, BlockHash, BlockHeader};
pub use chain::{block_reward, BlockOutcome, ChainState, ReorgEvent, TipInfo};
pub use config::ConsensusParams;
pub use crypto::{Address, KeyPair, Network};
pub use error::{CoreError, CoreResult};
pub use index::{AddressIndex, HistoryEntry};
pub use mempool::{Mempool, MempoolOverview, PressureState, TxOutcome};
pub use merkle::{MerkleProof, MerkleTree};
pub use storage::BlockStore;
pub use tx::{OutPoint, Transaction, TransactionType, TxInput, TxOutput};
pub use utxo::{Utxo, UtxoSet};
