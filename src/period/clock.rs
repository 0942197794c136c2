//! Epoch clock implementation
//!
//! Converts logical timestamps into fixed-length time buckets ("epochs") and
//! provides exact arithmetic on them. Epoch tokens are fixed-width radix-32
//! strings, so comparing two tokens as strings orders them the same way as
//! comparing the bucket indexes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Default bucket length in seconds
pub const DEFAULT_BUCKET_SECS: u64 = 30;

/// Width of an encoded epoch token (13 radix-32 digits cover a u64)
pub const EPOCH_TOKEN_WIDTH: usize = 13;

const RADIX: u64 = 32;
const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Identifier of one fixed-length time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// Create an epoch from its bucket index
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Get the bucket index
    pub fn index(&self) -> u64 {
        self.0
    }

    /// Encode the epoch as a fixed-width token
    pub fn token(&self) -> String {
        let mut buf = [b'0'; EPOCH_TOKEN_WIDTH];
        let mut n = self.0;
        for slot in buf.iter_mut().rev() {
            *slot = DIGITS[(n % RADIX) as usize];
            n /= RADIX;
        }
        buf.iter().map(|&b| b as char).collect()
    }

    /// Decode an epoch token.
    ///
    /// Accepts 1 to 13 radix-32 digits, so unpadded tokens decode to the same
    /// epoch as their padded form.
    pub fn parse(token: &str) -> Result<Self> {
        if token.is_empty() || token.len() > EPOCH_TOKEN_WIDTH {
            return Err(Error::invalid_epoch(format!("Invalid epoch token length: {:?}", token)));
        }

        let mut value: u64 = 0;
        for c in token.chars() {
            let digit = c
                .to_digit(RADIX as u32)
                .ok_or_else(|| Error::invalid_epoch(format!("Invalid epoch token: {:?}", token)))?;
            value = value
                .checked_mul(RADIX)
                .and_then(|v| v.checked_add(digit as u64))
                .ok_or_else(|| Error::invalid_epoch(format!("Epoch token overflows: {:?}", token)))?;
        }

        Ok(Self(value))
    }

    /// Get the following epoch
    pub fn next(&self) -> Result<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| Error::invalid_epoch(format!("No epoch after {}", self)))
    }

    /// Get the preceding epoch
    pub fn previous(&self) -> Result<Self> {
        self.0
            .checked_sub(1)
            .map(Self)
            .ok_or_else(|| Error::invalid_epoch(format!("No epoch before {}", self)))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

impl FromStr for Epoch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.token())
    }
}

impl<'de> Deserialize<'de> for Epoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Self::parse(&token).map_err(serde::de::Error::custom)
    }
}

/// Maps timestamps to epochs for a given bucket length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    bucket_secs: u64,
}

impl Default for EpochClock {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
        }
    }
}

impl EpochClock {
    /// Create a clock with the given bucket length in seconds
    pub fn new(bucket_secs: u64) -> Result<Self> {
        if bucket_secs == 0 {
            return Err(Error::config("Bucket length must be at least 1 second"));
        }
        Ok(Self { bucket_secs })
    }

    /// Get the bucket length
    pub fn bucket_length(&self) -> Duration {
        Duration::from_secs(self.bucket_secs)
    }

    /// Get the epoch containing a timestamp
    pub fn epoch_of(&self, timestamp: &DateTime<Utc>) -> Result<Epoch> {
        let secs = timestamp.timestamp();
        if secs < 0 {
            return Err(Error::invalid_epoch(format!(
                "Timestamp before the unix epoch: {}",
                timestamp
            )));
        }
        Ok(Epoch(secs as u64 / self.bucket_secs))
    }

    /// Get the epoch following `epoch`
    pub fn next(&self, epoch: Epoch) -> Result<Epoch> {
        epoch.next()
    }

    /// Get the epoch preceding `epoch`
    pub fn previous(&self, epoch: Epoch) -> Result<Epoch> {
        epoch.previous()
    }

    /// Get the half-open time range `[start, end)` covered by an epoch
    pub fn time_range(&self, epoch: Epoch) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let to_time = |index: u64| -> Result<DateTime<Utc>> {
            let secs = index
                .checked_mul(self.bucket_secs)
                .and_then(|s| i64::try_from(s).ok())
                .ok_or_else(|| Error::invalid_epoch(format!("Epoch out of range: {}", epoch)))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| Error::invalid_epoch(format!("Epoch out of range: {}", epoch)))
        };

        let start = to_time(epoch.index())?;
        let end = to_time(epoch.next()?.index())?;
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_of_timestamp() -> Result<()> {
        let clock = EpochClock::default();

        let timestamp = Utc.with_ymd_and_hms(2023, 5, 15, 12, 30, 0).unwrap();
        let epoch = clock.epoch_of(&timestamp)?;
        assert_eq!(epoch.index(), timestamp.timestamp() as u64 / 30);

        // Same bucket until the next 30 second boundary
        let later = timestamp + chrono::Duration::seconds(29);
        assert_eq!(clock.epoch_of(&later)?, epoch);
        let next = timestamp + chrono::Duration::seconds(30);
        assert_eq!(clock.epoch_of(&next)?, epoch.next()?);

        Ok(())
    }

    #[test]
    fn test_epoch_token_encoding() -> Result<()> {
        assert_eq!(Epoch::new(0).token(), "0000000000000");
        assert_eq!(Epoch::new(31).token(), "000000000000v");
        assert_eq!(Epoch::new(32).token(), "0000000000010");
        assert_eq!(Epoch::new(u64::MAX).token(), "fvvvvvvvvvvvv");

        // Unpadded and upper-case tokens decode too
        assert_eq!(Epoch::parse("10")?, Epoch::new(32));
        assert_eq!(Epoch::parse("V")?, Epoch::new(31));
        assert_eq!(Epoch::parse(&Epoch::new(u64::MAX).token())?, Epoch::new(u64::MAX));

        Ok(())
    }

    #[test]
    fn test_epoch_token_order_matches_index_order() {
        let indexes = [0u64, 1, 31, 32, 1023, 1024, 55_000_000, u64::MAX - 1];
        for pair in indexes.windows(2) {
            let (a, b) = (Epoch::new(pair[0]), Epoch::new(pair[1]));
            assert!(a < b);
            assert!(a.token() < b.token());
        }
    }

    #[test]
    fn test_invalid_tokens() {
        for token in ["", "w", "12-3", "00000000000000", "gvvvvvvvvvvvv", "<nil>"] {
            let err = Epoch::parse(token).unwrap_err();
            assert!(matches!(err, Error::InvalidEpoch(_)), "token {:?}", token);
        }
    }

    #[test]
    fn test_next_previous_round_trip() -> Result<()> {
        let epoch = Epoch::new(56_123_456);
        assert_eq!(epoch.next()?.previous()?, epoch);
        assert_eq!(Epoch::parse(&epoch.next()?.token())?.index(), 56_123_457);

        assert!(Epoch::new(0).previous().is_err());
        assert!(Epoch::new(u64::MAX).next().is_err());
        Ok(())
    }

    #[test]
    fn test_time_range() -> Result<()> {
        let clock = EpochClock::new(60)?;
        let timestamp = Utc.with_ymd_and_hms(2023, 5, 15, 12, 30, 42).unwrap();
        let epoch = clock.epoch_of(&timestamp)?;

        let (start, end) = clock.time_range(epoch)?;
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 5, 15, 12, 30, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2023, 5, 15, 12, 31, 0).unwrap());
        Ok(())
    }

    #[test]
    fn test_rejects_zero_bucket_and_negative_time() {
        assert!(EpochClock::new(0).is_err());

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 0).unwrap();
        assert!(EpochClock::default().epoch_of(&before_epoch).is_err());
    }

    #[test]
    fn test_serde_uses_token() {
        let epoch = Epoch::new(1024);
        let json = serde_json::to_string(&epoch).unwrap();
        assert_eq!(json, "\"0000000000100\"");
        let back: Epoch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, epoch);
    }
}
