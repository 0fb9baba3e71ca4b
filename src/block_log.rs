use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::crypto::digest;
use crate::errors::{ChainError, ChainResult};
use crate::types::{BlockId, SignedBlock};

const RECORD_HEADER_LEN: u64 = 4 + 32;
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Append-only log of irreversible blocks. Each record is
/// `[len: u32 LE][digest of payload][payload: bincode]`; the in-memory
/// indexes are rebuilt by scanning on open, truncating a torn tail.
#[derive(Debug)]
pub struct BlockLog {
    path: PathBuf,
    file: File,
    offsets: BTreeMap<u64, u64>,
    ids: HashMap<BlockId, u64>,
    head: Option<(u64, BlockId)>,
}

impl BlockLog {
    pub fn open(dir: &Path) -> ChainResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("blocks.log");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut log = Self {
            path,
            file,
            offsets: BTreeMap::new(),
            ids: HashMap::new(),
            head: None,
        };
        log.scan()?;
        Ok(log)
    }

    fn scan(&mut self) -> ChainResult<()> {
        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        while offset < file_len {
            if file_len - offset < RECORD_HEADER_LEN {
                self.truncate_tail(offset, file_len)?;
                break;
            }
            let mut len_bytes = [0u8; 4];
            self.file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes);
            if len == 0 || len > MAX_RECORD_LEN {
                return Err(ChainError::CorruptLog(format!(
                    "implausible record length {len} at offset {offset}"
                )));
            }
            if file_len - offset - RECORD_HEADER_LEN < u64::from(len) {
                self.truncate_tail(offset, file_len)?;
                break;
            }
            let mut stored_digest = [0u8; 32];
            self.file.read_exact(&mut stored_digest)?;
            let mut payload = vec![0u8; len as usize];
            self.file.read_exact(&mut payload)?;
            if digest(&payload).0 != stored_digest {
                return Err(ChainError::CorruptLog(format!(
                    "record digest mismatch at offset {offset}"
                )));
            }
            let block: SignedBlock = bincode::deserialize(&payload).map_err(|err| {
                ChainError::CorruptLog(format!("undecodable record at offset {offset}: {err}"))
            })?;
            let num = block.block_num();
            if let Some((head_num, _)) = self.head {
                if num != head_num + 1 {
                    return Err(ChainError::CorruptLog(format!(
                        "block {num} follows block {head_num}"
                    )));
                }
            }
            self.offsets.insert(num, offset);
            self.ids.insert(block.id(), num);
            self.head = Some((num, block.id()));
            offset += RECORD_HEADER_LEN + u64::from(len);
        }
        self.file.seek(SeekFrom::End(0))?;
        if let Some((num, _)) = self.head {
            info!(head = num, "opened block log");
        }
        Ok(())
    }

    fn truncate_tail(&mut self, valid_end: u64, file_len: u64) -> ChainResult<()> {
        warn!(
            valid_end,
            file_len, "truncating torn tail of block log"
        );
        self.file.set_len(valid_end)?;
        Ok(())
    }

    /// Appends the next irreversible block; heights must advance by exactly
    /// one.
    pub fn append(&mut self, block: &SignedBlock) -> ChainResult<()> {
        let num = block.block_num();
        if let Some((head_num, _)) = self.head {
            if num != head_num + 1 {
                return Err(ChainError::Config(format!(
                    "block log append out of order: {num} after {head_num}"
                )));
            }
        }
        let payload = bincode::serialize(block)?;
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&digest(&payload).0)?;
        self.file.write_all(&payload)?;
        self.file.flush()?;
        self.offsets.insert(num, offset);
        self.ids.insert(block.id(), num);
        self.head = Some((num, block.id()));
        Ok(())
    }

    pub fn head_num(&self) -> Option<u64> {
        self.head.map(|(num, _)| num)
    }

    pub fn read_head(&self) -> ChainResult<Option<SignedBlock>> {
        match self.head {
            Some((num, _)) => self.read_block_by_num(num),
            None => Ok(None),
        }
    }

    pub fn read_block_by_num(&self, num: u64) -> ChainResult<Option<SignedBlock>> {
        let Some(&offset) = self.offsets.get(&num) else {
            return Ok(None);
        };
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        let mut stored_digest = [0u8; 32];
        reader.read_exact(&mut stored_digest)?;
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if digest(&payload).0 != stored_digest {
            return Err(ChainError::CorruptLog(format!(
                "record digest mismatch at offset {offset}"
            )));
        }
        let block = bincode::deserialize(&payload).map_err(|err| {
            ChainError::CorruptLog(format!("undecodable record at offset {offset}: {err}"))
        })?;
        Ok(Some(block))
    }

    pub fn read_block_by_id(&self, id: &BlockId) -> ChainResult<Option<SignedBlock>> {
        match self.ids.get(id) {
            Some(&num) => self.read_block_by_num(num),
            None => Ok(None),
        }
    }

    pub fn contains_id(&self, id: &BlockId) -> bool {
        self.ids.contains_key(id)
    }
}
