//! Snapshot codec
//!
//! Serializes the epoch bookkeeping and the full period table into a compact
//! binary form:
//!
//! ```text
//! [current: uvarint len + utf8][retrieved: uvarint len + utf8][count: uvarint]
//! count x [(epoch: uvarint len + utf8)(name: uvarint len + utf8)(delivered: i64 LE)(bounced: i64 LE)]
//! ```
//!
//! An unset epoch is written as the empty string. Tuples of one epoch are
//! always contiguous; the decoder opens a new period whenever the epoch
//! changes and rejects input that would re-open an earlier one.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::period::{DomainCounters, Epoch, PeriodTable};

/// Smallest encoded tuple: two one-byte length prefixes and two i64 counters
const MIN_TUPLE_SIZE: u64 = 1 + 1 + 8 + 8;

/// Longest LEB128 encoding of a u64
const MAX_VARINT_LEN: usize = 10;

/// Epoch bookkeeping and counters decoded from a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoredState {
    /// Open epoch
    pub current: Option<Epoch>,
    /// Last extracted epoch
    pub retrieved: Option<Epoch>,
    /// Resident counters
    pub periods: PeriodTable,
}

/// Encode the state into snapshot bytes
pub fn persist(current: Option<Epoch>, retrieved: Option<Epoch>, periods: &PeriodTable) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + periods.domain_count() * 48);

    write_epoch(&mut buf, current)?;
    write_epoch(&mut buf, retrieved)?;
    write_uvarint(&mut buf, periods.domain_count() as u64)?;

    for (epoch, period) in periods.iter() {
        let token = epoch.token();
        for counters in period.values() {
            write_string(&mut buf, &token)?;
            write_string(&mut buf, &counters.name)?;
            buf.write_i64::<LittleEndian>(counters.delivered)?;
            buf.write_i64::<LittleEndian>(counters.bounced)?;
        }
    }

    Ok(buf)
}

/// Decode snapshot bytes
pub fn restore(bytes: &[u8]) -> Result<RestoredState> {
    let mut reader = Cursor::new(bytes);

    let current = read_epoch(&mut reader, "current")?;
    let retrieved = read_epoch(&mut reader, "retrieved")?;
    let count = read_uvarint(&mut reader)?;

    if count > remaining(&reader) / MIN_TUPLE_SIZE {
        return Err(Error::corrupt_snapshot(format!(
            "Tuple count {} exceeds the {} remaining bytes",
            count,
            remaining(&reader)
        )));
    }

    let mut periods = PeriodTable::new();
    let mut last_epoch: Option<Epoch> = None;

    for i in 0..count {
        let token = read_string(&mut reader)?;
        let epoch = Epoch::parse(&token)
            .map_err(|e| Error::corrupt_snapshot(format!("Tuple {}: {}", i, e)))?;
        let name = read_string(&mut reader)?;
        let delivered = read_counter(&mut reader)?;
        let bounced = read_counter(&mut reader)?;

        if name.is_empty() {
            return Err(Error::corrupt_snapshot(format!("Tuple {} has an empty domain name", i)));
        }

        if last_epoch != Some(epoch) {
            if periods.contains(epoch) {
                return Err(Error::corrupt_snapshot(format!(
                    "Epoch {} is not contiguous in the snapshot",
                    epoch
                )));
            }
            periods.get_or_create(epoch);
            last_epoch = Some(epoch);
        }

        if !periods.insert_counters(epoch, DomainCounters::with_counts(name.clone(), delivered, bounced)) {
            return Err(Error::corrupt_snapshot(format!(
                "Duplicate domain {} in epoch {}",
                name, epoch
            )));
        }
    }

    if remaining(&reader) != 0 {
        return Err(Error::corrupt_snapshot(format!(
            "{} trailing bytes after the last tuple",
            remaining(&reader)
        )));
    }

    Ok(RestoredState {
        current,
        retrieved,
        periods,
    })
}

/// Write an unsigned LEB128 varint
pub fn write_uvarint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<()> {
    while value >= 0x80 {
        writer.write_u8((value as u8) | 0x80)?;
        value >>= 7;
    }
    writer.write_u8(value as u8)
}

/// Read an unsigned LEB128 varint
pub fn read_uvarint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().map_err(short_read)?;
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(Error::corrupt_snapshot("Varint overflows 64 bits"));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::corrupt_snapshot("Varint overflows 64 bits"))
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_uvarint(writer, value.len() as u64)?;
    writer.write_all(value.as_bytes())
}

fn read_string(reader: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_uvarint(reader)?;
    if len > remaining(reader) {
        return Err(Error::corrupt_snapshot(format!(
            "Length prefix {} exceeds the {} remaining bytes",
            len,
            remaining(reader)
        )));
    }

    let mut data = vec![0; len as usize];
    reader.read_exact(&mut data).map_err(short_read)?;
    String::from_utf8(data).map_err(|e| Error::corrupt_snapshot(format!("Invalid UTF-8 string: {}", e)))
}

fn write_epoch<W: Write>(writer: &mut W, epoch: Option<Epoch>) -> io::Result<()> {
    match epoch {
        Some(epoch) => write_string(writer, &epoch.token()),
        None => write_string(writer, ""),
    }
}

fn read_epoch(reader: &mut Cursor<&[u8]>, field: &str) -> Result<Option<Epoch>> {
    let token = read_string(reader)?;
    if token.is_empty() {
        return Ok(None);
    }
    Epoch::parse(&token)
        .map(Some)
        .map_err(|e| Error::corrupt_snapshot(format!("Invalid {} epoch: {}", field, e)))
}

fn read_counter(reader: &mut Cursor<&[u8]>) -> Result<i64> {
    let value = reader.read_i64::<LittleEndian>().map_err(short_read)?;
    if value < 0 {
        return Err(Error::corrupt_snapshot(format!("Negative counter: {}", value)));
    }
    Ok(value)
}

fn remaining(reader: &Cursor<&[u8]>) -> u64 {
    (reader.get_ref().len() as u64).saturating_sub(reader.position())
}

fn short_read(err: io::Error) -> Error {
    Error::corrupt_snapshot(format!("Short read: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_table() -> PeriodTable {
        let mut table = PeriodTable::new();
        table.increment(Epoch::new(41), "acme.com", 10, 2);
        table.increment(Epoch::new(42), "acme.com", 1, 0);
        table.increment(Epoch::new(42), "zeta.io", 0, 3);
        table
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let table = sample_table();
        let bytes = persist(Some(Epoch::new(42)), Some(Epoch::new(40)), &table)?;
        let state = restore(&bytes)?;

        assert_eq!(state.current, Some(Epoch::new(42)));
        assert_eq!(state.retrieved, Some(Epoch::new(40)));
        assert_eq!(state.periods, table);
        Ok(())
    }

    #[test]
    fn test_empty_state_round_trip() -> Result<()> {
        let bytes = persist(None, None, &PeriodTable::new())?;
        // Two empty strings and a zero count
        assert_eq!(bytes, vec![0, 0, 0]);

        let state = restore(&bytes)?;
        assert_eq!(state, RestoredState::default());
        Ok(())
    }

    #[test]
    fn test_persist_is_deterministic() -> Result<()> {
        let table = sample_table();
        let a = persist(Some(Epoch::new(42)), None, &table)?;
        let b = persist(Some(Epoch::new(42)), None, &table.clone())?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_missing_tuple_is_corrupt() -> Result<()> {
        let mut table = PeriodTable::new();
        table.increment(Epoch::new(5), "a.com", 1, 0);
        table.increment(Epoch::new(5), "b.com", 1, 0);
        table.increment(Epoch::new(5), "c.com", 1, 0);
        let bytes = persist(Some(Epoch::new(5)), Some(Epoch::new(4)), &table)?;

        // Drop the last tuple but keep the count of 3
        let tuple_len = 1 + 13 + 1 + 5 + 8 + 8;
        let truncated = &bytes[..bytes.len() - tuple_len];
        let err = restore(truncated).unwrap_err();
        assert!(err.is_corrupt_snapshot());
        Ok(())
    }

    #[test]
    fn test_truncation_anywhere_is_corrupt() -> Result<()> {
        let bytes = persist(Some(Epoch::new(42)), Some(Epoch::new(41)), &sample_table())?;
        for len in 0..bytes.len() {
            assert!(restore(&bytes[..len]).unwrap_err().is_corrupt_snapshot(), "len {}", len);
        }
        Ok(())
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() -> Result<()> {
        let mut bytes = persist(None, None, &sample_table())?;
        bytes.push(0);
        assert!(restore(&bytes).unwrap_err().is_corrupt_snapshot());
        Ok(())
    }

    #[test]
    fn test_non_contiguous_epoch_is_corrupt() -> Result<()> {
        let mut bytes = Vec::new();
        write_string(&mut bytes, "")?;
        write_string(&mut bytes, "")?;
        write_uvarint(&mut bytes, 3)?;
        for (epoch, name) in [(1u64, "a.com"), (2, "a.com"), (1, "b.com")] {
            write_string(&mut bytes, &Epoch::new(epoch).token())?;
            write_string(&mut bytes, name)?;
            bytes.write_i64::<LittleEndian>(1)?;
            bytes.write_i64::<LittleEndian>(0)?;
        }

        let err = restore(&bytes).unwrap_err();
        assert!(err.to_string().contains("not contiguous"));
        Ok(())
    }

    #[test]
    fn test_oversized_length_prefix_is_corrupt() -> Result<()> {
        let mut bytes = Vec::new();
        write_uvarint(&mut bytes, u64::MAX)?;
        assert!(restore(&bytes).unwrap_err().is_corrupt_snapshot());

        let overlong = [0xffu8; 11];
        assert!(restore(&overlong).unwrap_err().is_corrupt_snapshot());
        Ok(())
    }

    #[test]
    fn test_varint_round_trip() -> Result<()> {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value)?;
            assert_eq!(read_uvarint(&mut Cursor::new(&buf[..]))?, value);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_restore_inverts_persist(
            entries in proptest::collection::vec((0u64..4, "[a-z]{1,8}\\.com", 0i64..10_000, 0i64..10_000), 0..40),
            current in proptest::option::of(0u64..8),
            retrieved in proptest::option::of(0u64..8),
        ) {
            let mut table = PeriodTable::new();
            for (epoch, name, delivered, bounced) in &entries {
                table.increment(Epoch::new(*epoch), name, *delivered, *bounced);
            }
            let current = current.map(Epoch::new);
            let retrieved = retrieved.map(Epoch::new);

            let bytes = persist(current, retrieved, &table).unwrap();
            let state = restore(&bytes).unwrap();
            prop_assert_eq!(state.current, current);
            prop_assert_eq!(state.retrieved, retrieved);
            prop_assert_eq!(state.periods, table);
        }
    }
}
