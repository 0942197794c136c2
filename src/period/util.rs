//! Utility functions for snapshot files
//!
//! Snapshot payloads produced by the codec are framed with a header and a
//! checksum before they reach disk, so a torn or bit-flipped file is detected
//! at restore time instead of silently producing partial state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::period::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

/// Number of snapshot files kept after a new one is written
const SNAPSHOTS_RETAINED: usize = 2;

/// Get the path for a snapshot taken at a log index
pub fn snapshot_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("snapshot-{:020}.snap", index))
}

/// List snapshot files in a directory, oldest first
pub fn list_snapshot_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if !path.is_file() || path.extension().map_or(true, |ext| ext != "snap") {
            continue;
        }

        let index = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.strip_prefix("snapshot-"))
            .and_then(|digits| digits.parse::<u64>().ok());

        if let Some(index) = index {
            result.push((index, path));
        }
    }

    result.sort_by_key(|(index, _)| *index);
    Ok(result)
}

/// Get the most recent snapshot file
pub fn latest_snapshot_file(dir: &Path) -> Result<Option<(u64, PathBuf)>> {
    Ok(list_snapshot_files(dir)?.pop())
}

/// Write a snapshot payload taken at `index`, then prune older files
pub fn save_snapshot(dir: &Path, index: u64, payload: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let path = snapshot_path(dir, index);
    let tmp_path = path.with_extension("snap.tmp");

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    {
        let mut writer = BufWriter::new(&file);

        // Header
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
        writer.write_u64::<LittleEndian>(index)?;
        writer.write_u64::<LittleEndian>(payload.len() as u64)?;
        writer.write_u32::<LittleEndian>(checksum(payload))?;

        writer.write_all(payload)?;
        writer.flush()?;
    }
    file.sync_all()?;

    fs::rename(&tmp_path, &path)?;

    prune_snapshots(dir, SNAPSHOTS_RETAINED)?;

    Ok(path)
}

/// Load a snapshot file, returning its log index and payload
pub fn load_snapshot(path: &Path) -> Result<(u64, Vec<u8>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let corrupt = |message: String| Error::corrupt_snapshot(format!("{}: {}", path.display(), message));

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| corrupt(format!("Failed to read magic: {}", e)))?;
    if magic != *SNAPSHOT_MAGIC {
        return Err(corrupt(format!("Invalid snapshot header: {:?}", magic)));
    }

    let version = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| corrupt(format!("Failed to read version: {}", e)))?;
    if version != SNAPSHOT_VERSION {
        return Err(corrupt(format!("Unsupported snapshot version: {}", version)));
    }

    let index = reader
        .read_u64::<LittleEndian>()
        .map_err(|e| corrupt(format!("Failed to read index: {}", e)))?;
    let len = reader
        .read_u64::<LittleEndian>()
        .map_err(|e| corrupt(format!("Failed to read length: {}", e)))?;
    let expected = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| corrupt(format!("Failed to read checksum: {}", e)))?;

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;

    if payload.len() as u64 != len {
        return Err(corrupt(format!(
            "Payload is {} bytes, header says {}",
            payload.len(),
            len
        )));
    }
    if checksum(&payload) != expected {
        return Err(corrupt("Checksum mismatch".to_string()));
    }

    Ok((index, payload))
}

/// Remove all but the newest `keep` snapshot files
pub fn prune_snapshots(dir: &Path, keep: usize) -> Result<usize> {
    let files = list_snapshot_files(dir)?;
    let excess = files.len().saturating_sub(keep);

    for (_, path) in files.iter().take(excess) {
        fs::remove_file(path)?;
    }

    Ok(excess)
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let payload = b"snapshot payload".to_vec();

        let path = save_snapshot(dir.path(), 17, &payload)?;
        assert_eq!(path, snapshot_path(dir.path(), 17));

        let (index, loaded) = load_snapshot(&path)?;
        assert_eq!(index, 17);
        assert_eq!(loaded, payload);
        Ok(())
    }

    #[test]
    fn test_flipped_byte_is_corrupt() -> Result<()> {
        let dir = tempdir()?;
        let path = save_snapshot(dir.path(), 3, b"abcdef")?;

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, bytes)?;

        let err = load_snapshot(&path).unwrap_err();
        assert!(err.is_corrupt_snapshot());
        Ok(())
    }

    #[test]
    fn test_truncated_file_is_corrupt() -> Result<()> {
        let dir = tempdir()?;
        let path = save_snapshot(dir.path(), 3, b"abcdef")?;

        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() - 2])?;
        assert!(load_snapshot(&path).unwrap_err().is_corrupt_snapshot());

        fs::write(&path, &bytes[..6])?;
        assert!(load_snapshot(&path).unwrap_err().is_corrupt_snapshot());
        Ok(())
    }

    #[test]
    fn test_latest_and_prune() -> Result<()> {
        let dir = tempdir()?;
        for index in [5u64, 12, 40] {
            save_snapshot(dir.path(), index, b"x")?;
        }
        // Unrelated files are ignored
        fs::write(dir.path().join("commands.log"), b"log")?;

        let files = list_snapshot_files(dir.path())?;
        let indexes: Vec<_> = files.iter().map(|(index, _)| *index).collect();
        assert_eq!(indexes, vec![12, 40]);

        let (latest, _) = latest_snapshot_file(dir.path())?.unwrap();
        assert_eq!(latest, 40);
        Ok(())
    }
}
