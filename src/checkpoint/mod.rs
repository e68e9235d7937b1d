//! UTXO checkpoints
//!
//! At configured heights the chain serializes its UTXO snapshot and
//! tip metadata into a checkpoint file. Snapshots are encrypted at
//! rest with XChaCha20-Poly1305 under a key derived from a persistent
//! master key; a plaintext payload still loads, but is logged as an
//! anomaly. Checkpointed blocks are final and bound reorg depth.

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::amount::Amount;
use crate::block::BlockHeader;
use crate::crypto::{random_24, random_32};
use crate::error::{CoreError, CoreResult};
use crate::utxo::Utxo;

const PAYLOAD_VERSION: u8 = 1;
const FLAG_ENCRYPTED: u8 = 1;
const FLAG_PLAINTEXT: u8 = 0;
const HKDF_INFO: &[u8] = b"xai-checkpoint-v1";

/// Checkpoint record persisted to `checkpoints/<height>.chk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub height: u64,
    pub block_hash: [u8; 32],
    pub previous_hash: [u8; 32],
    pub timestamp: u64,
    pub difficulty: u64,
    pub total_supply: Amount,
    pub merkle_root: [u8; 32],
    /// Versioned, flagged, normally encrypted UTXO snapshot.
    pub payload: Vec<u8>,
}

/// Writes and restores encrypted UTXO snapshots.
pub struct CheckpointManager {
    dir: PathBuf,
    master_key: [u8; 32],
}

impl CheckpointManager {
    /// Open the checkpoint directory, creating it and the persistent
    /// master key on first use.
    pub fn open(dir: &Path) -> CoreResult<CheckpointManager> {
        fs::create_dir_all(dir)?;
        let key_path = dir.join("checkpoint.key");
        let master_key = if key_path.exists() {
            let hex_key = fs::read_to_string(&key_path)?;
            let bytes = hex::decode(hex_key.trim())
                .map_err(|e| CoreError::StorageError(format!("corrupt checkpoint key: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| CoreError::StorageError("checkpoint key must be 32 bytes".into()))?
        } else {
            let key = random_32();
            write_atomic(&key_path, hex::encode(key).as_bytes())?;
            key
        };
        Ok(CheckpointManager {
            dir: dir.to_path_buf(),
            master_key,
        })
    }

    /// Serialize, encrypt, and persist a checkpoint for `header`.
    pub fn write_checkpoint(
        &self,
        header: &BlockHeader,
        utxos: &[Utxo],
        total_supply: Amount,
    ) -> CoreResult<()> {
        let snapshot =
            bincode::serialize(utxos).map_err(|e| CoreError::StorageError(e.to_string()))?;
        let payload = self.seal(&snapshot)?;
        let record = CheckpointRecord {
            height: header.index,
            block_hash: header.hash(),
            previous_hash: header.previous_hash,
            timestamp: header.timestamp,
            difficulty: header.difficulty,
            total_supply,
            merkle_root: header.merkle_root,
            payload,
        };
        let bytes =
            bincode::serialize(&record).map_err(|e| CoreError::StorageError(e.to_string()))?;
        write_atomic(&self.dir.join(format!("{}.chk", header.index)), &bytes)?;
        info!(
            "checkpoint written at height {} ({} utxos)",
            header.index,
            utxos.len()
        );
        Ok(())
    }

    /// Load a checkpoint and decrypt its UTXO snapshot.
    pub fn load_checkpoint(&self, height: u64) -> CoreResult<(CheckpointRecord, Vec<Utxo>)> {
        let path = self.dir.join(format!("{height}.chk"));
        let bytes = fs::read(&path)
            .map_err(|e| CoreError::StorageError(format!("{}: {e}", path.display())))?;
        let record: CheckpointRecord =
            bincode::deserialize(&bytes).map_err(|e| CoreError::StorageError(e.to_string()))?;
        let snapshot = self.unseal(&record.payload, height)?;
        let utxos: Vec<Utxo> =
            bincode::deserialize(&snapshot).map_err(|e| CoreError::StorageError(e.to_string()))?;
        Ok((record, utxos))
    }

    /// Highest checkpointed height on disk, if any.
    pub fn latest_height(&self) -> CoreResult<Option<u64>> {
        let mut latest = None;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(height) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".chk"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            latest = Some(latest.map_or(height, |h: u64| h.max(height)));
        }
        Ok(latest)
    }

    fn cipher(&self) -> CoreResult<XChaCha20Poly1305> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.master_key);
        let mut derived = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut derived)
            .map_err(|e| CoreError::StorageError(format!("key derivation: {e}")))?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(&derived)))
    }

    fn seal(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = random_24();
        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::StorageError("checkpoint encryption failed".into()))?;
        let mut payload = Vec::with_capacity(2 + nonce.len() + ciphertext.len());
        payload.push(PAYLOAD_VERSION);
        payload.push(FLAG_ENCRYPTED);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    fn unseal(&self, payload: &[u8], height: u64) -> CoreResult<Vec<u8>> {
        if payload.len() < 2 || payload[0] != PAYLOAD_VERSION {
            return Err(CoreError::StorageError(
                "unrecognized checkpoint payload".into(),
            ));
        }
        match payload[1] {
            FLAG_ENCRYPTED => {
                if payload.len() < 2 + 24 {
                    return Err(CoreError::StorageError("truncated checkpoint".into()));
                }
                let nonce = XNonce::from_slice(&payload[2..26]);
                self.cipher()?
                    .decrypt(nonce, &payload[26..])
                    .map_err(|_| {
                        CoreError::StorageError("checkpoint authentication failed".into())
                    })
            }
            FLAG_PLAINTEXT => {
                warn!("checkpoint at height {height} stored unencrypted; accepting anyway");
                Ok(payload[2..].to_vec())
            }
            other => Err(CoreError::StorageError(format!(
                "unknown checkpoint flag {other}"
            ))),
        }
    }
}

/// Write then rename so readers never observe a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
