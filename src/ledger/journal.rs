//! Hash-chained journal for the in-process ledger.
//!
//! Every committed write transaction becomes one block whose hash covers the
//! previous block's hash, so rewriting history breaks the chain. Blocks can be
//! persisted as length-prefixed MessagePack frames.

use crate::core::{LedgerError, LedgerResult};
use crate::ledger::CommitDigest;
use crate::transaction::Change;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Previous-hash of the first block
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalBlock {
    pub sequence: u64,
    pub transaction_id: String,
    pub committed_at: DateTime<Utc>,
    pub statements: Vec<String>,
    pub changes: Vec<Change>,
    pub previous_hash: String,
    pub hash: String,
}

/// Fields covered by the block hash
#[derive(Serialize)]
struct BlockPayload<'a> {
    sequence: u64,
    transaction_id: &'a str,
    committed_at: &'a DateTime<Utc>,
    statements: &'a [String],
    changes: &'a [Change],
}

impl JournalBlock {
    /// Hash of `previous_hash` followed by the canonical JSON of the payload
    pub fn compute_hash(&self) -> LedgerResult<String> {
        let payload = BlockPayload {
            sequence: self.sequence,
            transaction_id: &self.transaction_id,
            committed_at: &self.committed_at,
            statements: &self.statements,
            changes: &self.changes,
        };
        let encoded = serde_json::to_vec(&payload)
            .map_err(|e| LedgerError::JournalError(format!("Failed to encode block: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn digest(&self) -> CommitDigest {
        CommitDigest {
            transaction_id: self.transaction_id.clone(),
            sequence: self.sequence,
            hash: self.hash.clone(),
        }
    }
}

/// In-memory chain of blocks
#[derive(Debug, Default, Clone)]
pub struct Journal {
    blocks: Vec<JournalBlock>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a journal from stored blocks, refusing a broken chain
    pub fn from_blocks(blocks: Vec<JournalBlock>) -> LedgerResult<Self> {
        let journal = Self { blocks };
        journal.verify()?;
        Ok(journal)
    }

    pub fn blocks(&self) -> &[JournalBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Hash the next block would chain onto
    pub fn tip_hash(&self) -> &str {
        self.blocks.last().map(|b| b.hash.as_str()).unwrap_or(GENESIS_HASH)
    }

    /// Sequence of the last block, 0 for an empty journal
    pub fn tip_sequence(&self) -> u64 {
        self.blocks.last().map(|b| b.sequence).unwrap_or(0)
    }

    /// Build the next block without appending it
    pub fn seal(
        &self,
        transaction_id: &str,
        statements: Vec<String>,
        changes: Vec<Change>,
    ) -> LedgerResult<JournalBlock> {
        let mut block = JournalBlock {
            sequence: self.tip_sequence() + 1,
            transaction_id: transaction_id.to_string(),
            committed_at: Utc::now(),
            statements,
            changes,
            previous_hash: self.tip_hash().to_string(),
            hash: String::new(),
        };
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    /// Append a block sealed against the current tip
    pub fn append(&mut self, block: JournalBlock) -> LedgerResult<()> {
        if block.previous_hash != self.tip_hash() || block.sequence != self.tip_sequence() + 1 {
            return Err(LedgerError::JournalError(format!(
                "block {} does not extend the journal tip {}",
                block.sequence,
                self.tip_sequence()
            )));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Check sequence numbers, hash links and block hashes
    pub fn verify(&self) -> LedgerResult<()> {
        let mut previous = GENESIS_HASH.to_string();
        for (index, block) in self.blocks.iter().enumerate() {
            if block.sequence != index as u64 + 1 {
                return Err(LedgerError::JournalError(format!(
                    "block at position {} has sequence {}",
                    index, block.sequence
                )));
            }
            if block.previous_hash != previous {
                return Err(LedgerError::JournalError(format!(
                    "block {} does not link to its predecessor",
                    block.sequence
                )));
            }
            if block.compute_hash()? != block.hash {
                return Err(LedgerError::JournalError(format!(
                    "block {} hash mismatch",
                    block.sequence
                )));
            }
            previous = block.hash.clone();
        }
        Ok(())
    }
}

/// Appends blocks to a journal file, one fsync per block
pub struct JournalWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl JournalWriter {
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LedgerError::JournalError(format!("Failed to create journal directory: {}", e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::JournalError(format!("Failed to open journal: {}", e)))?;

        Ok(Self { path, file: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, block: &JournalBlock) -> LedgerResult<()> {
        let serialized = rmp_serde::to_vec_named(block)
            .map_err(|e| LedgerError::JournalError(format!("Failed to serialize block: {}", e)))?;
        let len = serialized.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&serialized)?;
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    /// Read every block stored at `path`; a missing file is an empty journal
    pub fn read_all<P: AsRef<Path>>(path: P) -> LedgerResult<Vec<JournalBlock>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path)
            .map_err(|e| LedgerError::JournalError(format!("Failed to open journal for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut blocks = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(LedgerError::JournalError(format!(
                        "Failed to read block length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .map_err(|e| LedgerError::JournalError(format!("Failed to read block data: {}", e)))?;
            let block: JournalBlock = rmp_serde::from_slice(&data)
                .map_err(|e| LedgerError::JournalError(format!("Failed to deserialize block: {}", e)))?;
            blocks.push(block);
        }
        Ok(blocks)
    }
}
