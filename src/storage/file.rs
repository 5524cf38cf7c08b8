//! File-based log implementation
//!
//! Stores state in two files within a directory:
//! - `meta` - metadata record (current term, vote) with checksum
//! - `log` - log entries (JSON lines format, each line has checksum)
//!
//! Every mutating operation fsyncs before reporting success, so an
//! acknowledged append or metadata update survives a crash. Checksums detect
//! corruption from partial writes; a torn final line is treated as
//! unwritten, so recovery yields a prefix of what was acknowledged.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::message::Entry;

use super::{LogMetadata, LogStore, StorageError};

/// Simple CRC32 checksum (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

fn checksummed_line(data: &str) -> String {
    format!("{} {:08x}\n", data, crc32(data.as_bytes()))
}

/// Split a `"{data} {crc32_hex}"` line and verify the checksum.
fn verify_line(line: &str, context: &str) -> Result<String, StorageError> {
    let (data, checksum_str) = line
        .rsplit_once(' ')
        .ok_or_else(|| StorageError::Corruption(format!("{context}: missing checksum")))?;
    let stored = u32::from_str_radix(checksum_str, 16)
        .map_err(|_| StorageError::Corruption(format!("{context}: invalid checksum format")))?;
    let computed = crc32(data.as_bytes());
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "{context}: checksum mismatch, stored {stored:08x}, computed {computed:08x}"
        )));
    }
    Ok(data.to_string())
}

/// Durable file-backed log store. Entries and metadata are cached in memory;
/// the files are the source of truth across restarts.
pub struct FileLog {
    dir: PathBuf,
    entries: Vec<Entry>,
    metadata: LogMetadata,
}

impl FileLog {
    /// Open (or create) a log in the given directory, loading any existing
    /// entries and metadata.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;

        let mut log = FileLog {
            dir,
            entries: Vec::new(),
            metadata: LogMetadata::default(),
        };
        log.metadata = log.load_metadata()?;
        log.entries = log.load_entries()?;
        Ok(log)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn load_metadata(&self) -> Result<LogMetadata, StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(LogMetadata::default());
        }
        let content = fs::read_to_string(&path).map_err(io_err)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(LogMetadata::default());
        }
        let json = verify_line(content, "meta")?;
        serde_json::from_str(&json)
            .map_err(|e| StorageError::Corruption(format!("invalid metadata: {e}")))
    }

    fn load_entries(&self) -> Result<Vec<Entry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(io_err)?;
        let reader = BufReader::new(file);
        let mut entries: Vec<Entry> = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let context = format!("log line {}", line_num + 1);
            let json = verify_line(&line, &context)?;
            let entry: Entry = serde_json::from_str(&json)
                .map_err(|e| StorageError::Corruption(format!("{context}: {e}")))?;
            if entry.id != entries.len() as u64 + 1 {
                return Err(StorageError::Corruption(format!(
                    "{context}: expected id {}, found {}",
                    entries.len() + 1,
                    entry.id
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Atomically replace a file (write temp, fsync, rename). Used where the
    /// whole file is rewritten, i.e. metadata updates and truncation.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&temp_path, path).map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

impl LogStore for FileLog {
    fn append(&mut self, mut entry: Entry) -> Result<u64, StorageError> {
        let id = self.entries.len() as u64 + 1;
        entry.id = id;

        let json = serde_json::to_string(&entry).map_err(|e| StorageError::Io(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(io_err)?;
        file.write_all(checksummed_line(&json).as_bytes())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        self.entries.push(entry);
        Ok(id)
    }

    fn last_id(&self) -> u64 {
        self.entries.len() as u64
    }

    fn entry(&self, id: u64) -> &Entry {
        &self.entries[(id - 1) as usize]
    }

    fn term(&self, id: u64) -> u64 {
        if id == 0 || id > self.last_id() {
            0
        } else {
            self.entries[(id - 1) as usize].term
        }
    }

    fn begin_last_term_id(&self) -> u64 {
        let last_term = match self.entries.last() {
            Some(e) => e.term,
            None => return 0,
        };
        let mut begin = self.last_id();
        while begin > 1 && self.entries[(begin - 2) as usize].term == last_term {
            begin -= 1;
        }
        begin
    }

    fn truncate(&mut self, last_kept_id: u64) -> Result<(), StorageError> {
        if last_kept_id >= self.last_id() {
            return Ok(());
        }
        let mut content = String::new();
        for entry in &self.entries[..last_kept_id as usize] {
            let json = serde_json::to_string(entry).map_err(|e| StorageError::Io(e.to_string()))?;
            content.push_str(&checksummed_line(&json));
        }
        self.atomic_write(&self.log_path(), content.as_bytes())?;
        self.entries.truncate(last_kept_id as usize);
        Ok(())
    }

    fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    fn update_metadata(&mut self, meta: LogMetadata) -> Result<(), StorageError> {
        let json = serde_json::to_string(&meta).map_err(|e| StorageError::Io(e.to_string()))?;
        self.atomic_write(&self.meta_path(), checksummed_line(&json).as_bytes())?;
        self.metadata = meta;
        Ok(())
    }
}
