//! Write-ahead log of committed statements.
//!
//! Every statement is appended (and optionally fsync'd) before it is applied
//! to the in-memory tables, so a write is only acknowledged once it would
//! survive a restart. On open, a torn or corrupt tail left by a crash is
//! truncated away.

use crate::database::Statement;
use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Header length: magic + version.
const HEADER_LEN: u64 = 5;

/// Upper bound on a single encoded entry.
const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// A single WAL entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number, restarting at 1 after each checkpoint.
    pub seq: u64,
    pub statement: Statement,
    pub timestamp: Timestamp,
}

struct WalInner {
    file: File,
    next_seq: u64,
    /// Byte length of the valid prefix of the file.
    len: u64,
}

/// Write-Ahead Log manager.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
    sync_writes: bool,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let inner = if path.exists() {
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            Self::verify_header(&mut file)?;

            let (entries, valid_len) = Self::scan(&path)?;
            let file_len = file.metadata()?.len();
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len,
                    "truncating torn WAL tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }

            let next_seq = entries.last().map_or(1, |e| e.seq + 1);
            WalInner {
                file,
                next_seq,
                len: valid_len,
            }
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(WAL_MAGIC)?;
            file.write_all(&[WAL_VERSION])?;
            file.sync_all()?;

            WalInner {
                file,
                next_seq: 1,
                len: HEADER_LEN,
            }
        };

        Ok(Self {
            path,
            inner: Mutex::new(inner),
            sync_writes,
        })
    }

    /// Append a statement. Returns its sequence number once it is on disk.
    ///
    /// A failed write is cut back off the file so later entries stay readable.
    pub fn append(&self, statement: &Statement) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;

        let entry = WalEntry {
            seq,
            statement: statement.clone(),
            timestamp: Timestamp::now(),
        };
        let frame = Self::encode_entry(&entry)?;

        let start = inner.len;
        let written = Self::write_frame(&mut inner.file, start, &frame, self.sync_writes);
        if let Err(e) = written {
            let _ = inner.file.set_len(start);
            return Err(e);
        }

        inner.len = start + frame.len() as u64;
        inner.next_seq += 1;
        Ok(seq)
    }

    /// Read all entries in log order.
    pub fn entries(&self) -> Result<Vec<WalEntry>> {
        let _guard = self.inner.lock();
        Ok(Self::scan(&self.path)?.0)
    }

    /// Number of entries since the last clear.
    pub fn len(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the WAL (called after a successful checkpoint).
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(HEADER_LEN)?;
        inner.file.sync_all()?;
        inner.len = HEADER_LEN;
        inner.next_seq = 1;
        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid WAL magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported WAL version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    /// Read entries up to the first incomplete or corrupt one.
    ///
    /// Returns the entries and the byte length of the valid prefix.
    fn scan(path: &Path) -> Result<(Vec<WalEntry>, u64)> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut offset = HEADER_LEN;

        while let Ok((entry, frame_len)) = Self::read_entry(&mut reader) {
            entries.push(entry);
            offset += frame_len;
        }

        Ok((entries, offset))
    }

    fn encode_entry(entry: &WalEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    fn write_frame(file: &mut File, offset: u64, frame: &[u8], sync: bool) -> Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(frame)?;
        file.flush()?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<(WalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StoreError::Corruption("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);

        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, (len + 8) as u64))
    }
}
