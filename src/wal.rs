//! Command log for the local consensus provider
//!
//! Every write command is appended with its log index and the logical time
//! at which it was committed. Replaying the log over the latest snapshot
//! rebuilds the exact replica state, because the state machine only reads
//! time from the logged timestamp.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bincode::{deserialize, serialize};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::machine::Command;
use crate::metrics::MetricsCollector;

// Magic bytes to identify command log files
const LOG_MAGIC: &[u8; 4] = b"CALG"; // "Catchall Log"
const LOG_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16; // Magic(4) + Version(4) + BaseIndex(8)
const ENTRY_HEADER_SIZE: u64 = 24; // Index(8) + Timestamp(8) + Checksum(4) + DataLength(4)

/// Upper bound on a single encoded command
const MAX_ENTRY_SIZE: u32 = 1024 * 1024;

/// File name of the command log inside a data directory
pub const LOG_FILE_NAME: &str = "commands.log";

/// A committed command together with its log position and logical time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log index, starting at 1
    pub index: u64,
    /// Logical commit time
    pub timestamp: DateTime<Utc>,
    /// The command
    pub command: Command,
}

/// Raw entry as stored on disk
#[derive(Debug, Clone)]
struct RawEntry {
    index: u64,
    timestamp_ms: i64,
    checksum: u32,
    data: Vec<u8>,
}

impl RawEntry {
    fn new(index: u64, timestamp: &DateTime<Utc>, command: &Command) -> Result<Self> {
        let data = serialize(command)?;
        let timestamp_ms = timestamp.timestamp_millis();
        let checksum = Self::compute_checksum(index, timestamp_ms, &data);

        Ok(Self {
            index,
            timestamp_ms,
            checksum,
            data,
        })
    }

    /// Size of this entry in bytes
    fn size(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.data.len() as u64
    }

    fn is_valid(&self) -> bool {
        Self::compute_checksum(self.index, self.timestamp_ms, &self.data) == self.checksum
    }

    fn compute_checksum(index: u64, timestamp_ms: i64, data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&index.to_le_bytes());
        hasher.update(&timestamp_ms.to_le_bytes());
        hasher.update(data);
        hasher.finalize()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.write_u64::<LittleEndian>(self.index)?;
        buf.write_i64::<LittleEndian>(self.timestamp_ms)?;
        buf.write_u32::<LittleEndian>(self.checksum)?;
        buf.write_u32::<LittleEndian>(self.data.len() as u32)?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    fn into_entry(self) -> Result<LogEntry> {
        let command = deserialize(&self.data)?;
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| Error::wal(format!("Invalid timestamp in entry {}", self.index)))?;

        Ok(LogEntry {
            index: self.index,
            timestamp,
            command,
        })
    }
}

/// Append-only log of committed write commands
pub struct CommandLog {
    /// Path of the log file
    path: PathBuf,
    /// Open log file
    file: Mutex<File>,
    /// Index covered by the last snapshot
    base_index: AtomicU64,
    /// Index of the next appended entry
    next_index: AtomicU64,
    /// Write position in the file
    position: AtomicU64,
    /// Whether to sync after every append
    sync_writes: bool,
    /// Metrics collector
    metrics: Arc<MetricsCollector>,
}

impl CommandLog {
    /// Open the command log in `dir`, creating it if needed.
    ///
    /// Returns the log and every intact entry in index order. A torn or
    /// corrupt tail is dropped from the file.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        sync_writes: bool,
        metrics: Arc<MetricsCollector>,
    ) -> Result<(Self, Vec<LogEntry>)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            Error::wal(format!(
                "Failed to create log directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(LOG_FILE_NAME);
        let exists = path.exists() && fs::metadata(&path)?.len() > 0;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::wal(format!("Failed to open log file {}: {}", path.display(), e)))?;

        let (base_index, entries, position) = if exists {
            Self::recover(&mut file, &path)?
        } else {
            Self::write_header(&mut file, 0)?;
            (0, Vec::new(), HEADER_SIZE)
        };

        let next_index = entries.last().map_or(base_index, |entry| entry.index) + 1;

        debug!(
            path = %path.display(),
            base_index,
            entries = entries.len(),
            "opened command log"
        );

        let log = Self {
            path,
            file: Mutex::new(file),
            base_index: AtomicU64::new(base_index),
            next_index: AtomicU64::new(next_index),
            position: AtomicU64::new(position),
            sync_writes,
            metrics,
        };

        Ok((log, entries))
    }

    /// Append a committed command, returning its log index
    pub fn append(&self, timestamp: &DateTime<Utc>, command: &Command) -> Result<u64> {
        let mut file = self.file.lock();

        let index = self.next_index.load(Ordering::SeqCst);
        let entry = RawEntry::new(index, timestamp, command)?;
        let bytes = entry.encode()?;

        let start = Instant::now();
        file.seek(SeekFrom::Start(self.position.load(Ordering::SeqCst)))?;
        file.write_all(&bytes)?;
        file.flush()?;
        self.metrics.record_wal_write_duration(start.elapsed());

        if self.sync_writes {
            let start = Instant::now();
            file.sync_data()?;
            self.metrics.record_wal_sync_duration(start.elapsed());
        }

        self.position.fetch_add(entry.size(), Ordering::SeqCst);
        self.next_index.store(index + 1, Ordering::SeqCst);

        // Update metrics
        self.metrics.add_wal_bytes_written(bytes.len());

        Ok(index)
    }

    /// Drop every entry, recording `base_index` as covered by a snapshot
    pub fn reset(&self, base_index: u64) -> Result<()> {
        let mut file = self.file.lock();

        file.set_len(0)?;
        Self::write_header(&mut file, base_index)?;
        file.sync_all()?;

        self.base_index.store(base_index, Ordering::SeqCst);
        self.next_index.store(base_index + 1, Ordering::SeqCst);
        self.position.store(HEADER_SIZE, Ordering::SeqCst);

        debug!(base_index, "compacted command log");

        Ok(())
    }

    /// Sync the log to disk
    pub fn sync(&self) -> Result<()> {
        let start = Instant::now();
        self.file
            .lock()
            .sync_all()
            .map_err(|e| Error::wal(format!("Failed to sync log file: {}", e)))?;
        self.metrics.record_wal_sync_duration(start.elapsed());
        Ok(())
    }

    /// Get the path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the index covered by the last snapshot
    pub fn base_index(&self) -> u64 {
        self.base_index.load(Ordering::SeqCst)
    }

    /// Get the index of the last appended entry
    pub fn last_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst) - 1
    }

    /// Number of entries since the last snapshot
    pub fn len(&self) -> u64 {
        self.last_index() - self.base_index()
    }

    /// Check if no entry follows the last snapshot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Helper methods

    fn write_header(file: &mut File, base_index: u64) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(LOG_MAGIC);
        header.write_u32::<LittleEndian>(LOG_VERSION)?;
        header.write_u64::<LittleEndian>(base_index)?;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;
        Ok(())
    }

    /// Read every intact entry and cut the file after the last one
    fn recover(file: &mut File, path: &Path) -> Result<(u64, Vec<LogEntry>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&*file);

        let base_index = Self::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut position = HEADER_SIZE;
        let mut expected = base_index + 1;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(raw)) => {
                    if !raw.is_valid() {
                        warn!(index = raw.index, "checksum mismatch in command log");
                        break;
                    }
                    if raw.index != expected {
                        warn!(index = raw.index, expected, "out of order entry in command log");
                        break;
                    }

                    let size = raw.size();
                    match raw.into_entry() {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!(error = %e, "undecodable entry in command log");
                            break;
                        }
                    }

                    position += size;
                    expected += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "torn entry in command log");
                    break;
                }
            }
        }

        drop(reader);

        let len = file.metadata()?.len();
        if len > position {
            warn!(
                path = %path.display(),
                dropped_bytes = len - position,
                "truncating command log tail"
            );
            file.set_len(position)?;
            file.sync_all()?;
        }

        Ok((base_index, entries, position))
    }

    fn read_header<R: Read>(reader: &mut R) -> Result<u64> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| Error::wal(format!("Failed to read log magic: {}", e)))?;

        if magic != *LOG_MAGIC {
            return Err(Error::wal(format!("Invalid log header: {:?}", magic)));
        }

        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::wal(format!("Failed to read log version: {}", e)))?;
        if version != LOG_VERSION {
            return Err(Error::wal(format!("Unsupported log version: {}", version)));
        }

        reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::wal(format!("Failed to read base index: {}", e)))
    }

    /// Read the next entry, `None` at a clean end of file
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<RawEntry>> {
        let index = match reader.read_u64::<LittleEndian>() {
            Ok(index) => index,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::wal(format!("Read error: {}", e))),
        };

        let read_err = |e: io::Error| Error::wal(format!("Read error: {}", e));

        let timestamp_ms = reader.read_i64::<LittleEndian>().map_err(read_err)?;
        let checksum = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        let data_len = reader.read_u32::<LittleEndian>().map_err(read_err)?;

        if data_len > MAX_ENTRY_SIZE {
            return Err(Error::wal(format!("Entry length {} exceeds limit", data_len)));
        }

        let mut data = vec![0; data_len as usize];
        reader.read_exact(&mut data).map_err(read_err)?;

        Ok(Some(RawEntry {
            index,
            timestamp_ms,
            checksum,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Epoch;
    use tempfile::tempdir;

    fn incr(domain: &str) -> Command {
        Command::Incr {
            domain: domain.to_string(),
            delivered: 1,
            bounced: 0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_append_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let metrics = Arc::new(MetricsCollector::new());

        {
            let (log, entries) = CommandLog::open(dir.path(), false, metrics.clone())?;
            assert!(entries.is_empty());
            assert_eq!(log.append(&at(30_000), &incr("a.com"))?, 1);
            assert_eq!(
                log.append(&at(30_031), &Command::Extract { epoch: Epoch::new(1000) })?,
                2
            );
            assert_eq!(log.len(), 2);
        }

        let (log, entries) = CommandLog::open(dir.path(), false, metrics.clone())?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].timestamp, at(30_000));
        assert_eq!(entries[0].command, incr("a.com"));
        assert_eq!(entries[1].command, Command::Extract { epoch: Epoch::new(1000) });
        assert_eq!(log.last_index(), 2);
        assert!(metrics.get_wal_bytes_written() > 0);

        // Appends continue the index sequence
        assert_eq!(log.append(&at(30_040), &incr("b.com"))?, 3);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<()> {
        let dir = tempdir()?;
        let metrics = Arc::new(MetricsCollector::new());

        let path = {
            let (log, _) = CommandLog::open(dir.path(), false, metrics.clone())?;
            log.append(&at(1), &incr("a.com"))?;
            log.append(&at(2), &incr("b.com"))?;
            log.path().to_path_buf()
        };

        // Cut the last entry in half
        let len = fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 5)?;
        drop(file);

        let (log, entries) = CommandLog::open(dir.path(), false, metrics.clone())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, incr("a.com"));
        assert_eq!(log.append(&at(3), &incr("c.com"))?, 2);
        drop(log);

        let (_, entries) = CommandLog::open(dir.path(), false, metrics)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].command, incr("c.com"));
        Ok(())
    }

    #[test]
    fn test_flipped_byte_stops_replay() -> Result<()> {
        let dir = tempdir()?;
        let metrics = Arc::new(MetricsCollector::new());

        let path = {
            let (log, _) = CommandLog::open(dir.path(), false, metrics.clone())?;
            log.append(&at(1), &incr("a.com"))?;
            log.append(&at(2), &incr("b.com"))?;
            log.path().to_path_buf()
        };

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes)?;

        let (_, entries) = CommandLog::open(dir.path(), false, metrics)?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn test_reset_keeps_index_sequence() -> Result<()> {
        let dir = tempdir()?;
        let metrics = Arc::new(MetricsCollector::new());

        let (log, _) = CommandLog::open(dir.path(), true, metrics.clone())?;
        log.append(&at(1), &incr("a.com"))?;
        log.append(&at(2), &incr("a.com"))?;
        log.reset(2)?;
        assert!(log.is_empty());
        assert_eq!(log.base_index(), 2);
        assert_eq!(log.append(&at(3), &incr("b.com"))?, 3);
        drop(log);

        let (log, entries) = CommandLog::open(dir.path(), true, metrics)?;
        assert_eq!(log.base_index(), 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 3);
        Ok(())
    }

    #[test]
    fn test_bad_header_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join(LOG_FILE_NAME), b"not a command log")?;

        let result = CommandLog::open(dir.path(), false, Arc::new(MetricsCollector::new()));
        assert!(matches!(result, Err(Error::Wal(_))));
        Ok(())
    }
}
