//! Dirty-block journal
//!
//! Write-back acknowledges data before it reaches the object store. When a
//! journal is configured, every accepted write is appended here first, and
//! the matching record is marked flushed once the downstream PUT/DELETE
//! completes. A later instance started with dirty-block recovery replays
//! the unflushed tail and re-queues those blocks as dirty.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, warn};

use s3bd_common::{Error, Result};

use crate::store::BlockIndex;

/// Magic number for the journal file header
const JOURNAL_MAGIC: u64 = 0x5333_4244_4a52_4e4c; // "S3BDJRNL"

/// Journal file version
const JOURNAL_VERSION: u32 = 1;

/// Header: magic + version
const HEADER_LEN: u64 = 12;

/// Fixed record prelude: type(1) + sequence(8) + index(8) + len(4) + crc(4)
const RECORD_PRELUDE_LEN: usize = 25;

/// Journal record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Block became dirty with the attached payload (len 0 means all-zero)
    Write = 1,
    /// Block was propagated downstream
    Flushed = 2,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Write),
            2 => Ok(RecordType::Flushed),
            _ => Err(Error::Journal(format!("invalid record type: {value}"))),
        }
    }
}

struct JournalInner {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only dirty journal with CRC-checked records
pub struct DirtyJournal {
    path: PathBuf,
    block_size: usize,
    inner: Mutex<JournalInner>,
}

impl DirtyJournal {
    /// Open (or create) the journal at `path`.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Journal(format!("open {}: {e}", path.display())))?;

        let len = file
            .metadata()
            .map_err(|e| Error::Journal(e.to_string()))?
            .len();
        if len < HEADER_LEN {
            file.set_len(0).map_err(|e| Error::Journal(e.to_string()))?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| Error::Journal(e.to_string()))?;
            file.write_all(&JOURNAL_MAGIC.to_le_bytes())
                .and_then(|()| file.write_all(&JOURNAL_VERSION.to_le_bytes()))
                .map_err(|e| Error::Journal(format!("write header: {e}")))?;
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))
                .map_err(|e| Error::Journal(e.to_string()))?;
            file.read_exact(&mut header)
                .map_err(|e| Error::Journal(format!("read header: {e}")))?;
            let magic = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
            if magic != JOURNAL_MAGIC {
                return Err(Error::Journal(format!(
                    "{} is not a journal file",
                    path.display()
                )));
            }
            if version != JOURNAL_VERSION {
                return Err(Error::Journal(format!(
                    "unsupported journal version {version}"
                )));
            }
            file.seek(SeekFrom::End(0))
                .map_err(|e| Error::Journal(e.to_string()))?;
        }

        Ok(Self {
            path,
            block_size,
            inner: Mutex::new(JournalInner {
                writer: BufWriter::new(file),
                sequence: 0,
            }),
        })
    }

    fn append(&self, rtype: RecordType, idx: BlockIndex, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let seq = inner.sequence;

        let mut prelude = Vec::with_capacity(RECORD_PRELUDE_LEN);
        prelude.push(rtype as u8);
        prelude.extend_from_slice(&seq.to_le_bytes());
        prelude.extend_from_slice(&idx.to_le_bytes());
        prelude.extend_from_slice(&(data.len() as u32).to_le_bytes());

        let mut crc = crc32c::crc32c(&prelude);
        crc = crc32c::crc32c_append(crc, data);
        prelude.extend_from_slice(&crc.to_le_bytes());

        inner
            .writer
            .write_all(&prelude)
            .and_then(|()| inner.writer.write_all(data))
            .map_err(|e| Error::Journal(format!("append: {e}")))
    }

    /// Record a write of block `idx`. `None` payload means all-zero.
    pub fn log_write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<()> {
        self.append(RecordType::Write, idx, data.unwrap_or(&[]))
    }

    /// Record that block `idx` was propagated downstream.
    pub fn log_flushed(&self, idx: BlockIndex) -> Result<()> {
        self.append(RecordType::Flushed, idx, &[])
    }

    /// Flush buffered records to the OS.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| Error::Journal(format!("sync: {e}")))
    }

    /// Discard everything recorded so far. Called once a flush fence has
    /// drained the dirty set.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .flush()
            .map_err(|e| Error::Journal(e.to_string()))?;
        let file = inner.writer.get_mut();
        file.set_len(HEADER_LEN)
            .map_err(|e| Error::Journal(format!("truncate: {e}")))?;
        file.seek(SeekFrom::Start(HEADER_LEN))
            .map_err(|e| Error::Journal(e.to_string()))?;
        inner.sequence = 0;
        Ok(())
    }

    /// Replay the journal and return the blocks still dirty, newest payload
    /// per block. A corrupt or truncated tail ends the replay with a
    /// warning; everything before it is kept.
    pub fn recover(&self) -> Result<Vec<(BlockIndex, Option<Bytes>)>> {
        self.sync()?;

        let mut file = File::open(&self.path)
            .map_err(|e| Error::Journal(format!("open {}: {e}", self.path.display())))?;
        file.seek(SeekFrom::Start(HEADER_LEN))
            .map_err(|e| Error::Journal(e.to_string()))?;

        let mut dirty: std::collections::BTreeMap<BlockIndex, Option<Bytes>> =
            std::collections::BTreeMap::new();
        let mut replayed = 0usize;

        loop {
            let mut prelude = [0u8; RECORD_PRELUDE_LEN];
            match file.read_exact(&mut prelude) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Journal(format!("read record: {e}"))),
            }

            let rtype = prelude[0];
            let idx = u64::from_le_bytes(prelude[9..17].try_into().unwrap());
            let len = u32::from_le_bytes(prelude[17..21].try_into().unwrap()) as usize;
            let stored_crc = u32::from_le_bytes(prelude[21..25].try_into().unwrap());

            if len > self.block_size {
                warn!(len, "journal record longer than a block, stopping replay");
                break;
            }
            let mut data = vec![0u8; len];
            if let Err(e) = file.read_exact(&mut data) {
                warn!("journal tail truncated ({e}), stopping replay");
                break;
            }

            let mut crc = crc32c::crc32c(&prelude[..RECORD_PRELUDE_LEN - 4]);
            crc = crc32c::crc32c_append(crc, &data);
            if crc != stored_crc {
                warn!("journal record checksum mismatch, stopping replay");
                break;
            }

            match RecordType::try_from(rtype) {
                Ok(RecordType::Write) => {
                    let payload = if data.is_empty() {
                        None
                    } else {
                        Some(Bytes::from(data))
                    };
                    dirty.insert(idx, payload);
                }
                Ok(RecordType::Flushed) => {
                    dirty.remove(&idx);
                }
                Err(_) => {
                    warn!(rtype, "unknown journal record type, stopping replay");
                    break;
                }
            }
            replayed += 1;
        }

        if !dirty.is_empty() {
            info!(
                records = replayed,
                dirty = dirty.len(),
                "recovered dirty blocks from journal"
            );
        }
        Ok(dirty.into_iter().collect())
    }
}
