//! Replicated state machine for one shard
//!
//! Every replica of a shard applies the same commands in the same order.
//! The only notion of time is the logical timestamp handed in by the
//! consensus provider with each command, so all replicas open the same epoch
//! for the same log index.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::period::{codec, flatten, DomainCounters, Epoch, EpochClock, PeriodTable};

/// Token printed for an unset epoch in `DBINFO` replies
pub const NIL_EPOCH: &str = "<nil>";

/// A command applied by the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// `INCR domain delivered bounced`
    Incr {
        domain: String,
        delivered: i64,
        bounced: i64,
    },
    /// `EXTRACT epoch`
    Extract { epoch: Epoch },
    /// `SCAN epoch`
    Scan { epoch: Epoch },
    /// `DBINFO`
    DbInfo,
    /// `PING`
    Ping,
}

impl Command {
    /// Parse a command from its name followed by its arguments
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let (name, rest) = match args.split_first() {
            Some((name, rest)) => (name.as_ref().to_ascii_uppercase(), rest),
            None => return Err(Error::wrong_arguments("Empty command")),
        };

        let expect = |count: usize| -> Result<()> {
            if rest.len() != count {
                return Err(Error::wrong_arguments(format!(
                    "{} expects {} arguments, got {}",
                    name,
                    count,
                    rest.len()
                )));
            }
            Ok(())
        };

        match name.as_str() {
            "INCR" => {
                expect(3)?;
                let domain = rest[0].as_ref();
                if domain.is_empty() {
                    return Err(Error::wrong_arguments("INCR requires a domain name"));
                }
                Ok(Self::Incr {
                    domain: domain.to_string(),
                    delivered: parse_count("delivered", rest[1].as_ref())?,
                    bounced: parse_count("bounced", rest[2].as_ref())?,
                })
            }
            "EXTRACT" => {
                expect(1)?;
                Ok(Self::Extract {
                    epoch: Epoch::parse(rest[0].as_ref())?,
                })
            }
            "SCAN" => {
                expect(1)?;
                Ok(Self::Scan {
                    epoch: Epoch::parse(rest[0].as_ref())?,
                })
            }
            "DBINFO" => {
                expect(0)?;
                Ok(Self::DbInfo)
            }
            "PING" => {
                expect(0)?;
                Ok(Self::Ping)
            }
            _ => Err(Error::unknown_command(name)),
        }
    }

    /// Get the command name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Incr { .. } => "INCR",
            Self::Extract { .. } => "EXTRACT",
            Self::Scan { .. } => "SCAN",
            Self::DbInfo => "DBINFO",
            Self::Ping => "PING",
        }
    }

    /// Check if the command mutates replicated state
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Incr { .. } | Self::Extract { .. })
    }

    /// Render the command back into its argument list
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            Self::Incr {
                domain,
                delivered,
                bounced,
            } => {
                args.push(domain.clone());
                args.push(delivered.to_string());
                args.push(bounced.to_string());
            }
            Self::Extract { epoch } | Self::Scan { epoch } => args.push(epoch.token()),
            Self::DbInfo | Self::Ping => {}
        }
        args
    }
}

fn parse_count(field: &str, value: &str) -> Result<i64> {
    match value.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(Error::wrong_arguments(format!(
            "{} must be a non-negative integer, got {:?}",
            field, value
        ))),
    }
}

/// Reply to an applied command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Acknowledgement of a write
    Ok,
    /// Reply to `PING`
    Pong,
    /// Flat `[name, delivered, bounced]*` sequence
    Tuples(Vec<String>),
    /// `"current retrieved"` line
    Info(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Pong => write!(f, "PONG"),
            Self::Tuples(fields) => write!(f, "[{}]", fields.join(", ")),
            Self::Info(line) => write!(f, "{}", line),
        }
    }
}

/// Epoch bookkeeping reported by `DBINFO`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    /// Open epoch
    pub current: Option<Epoch>,
    /// Last extracted epoch
    pub retrieved: Option<Epoch>,
}

impl EpochInfo {
    /// Parse a `DBINFO` line
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split(' ');
        let (current, retrieved) = match (parts.next(), parts.next(), parts.next()) {
            (Some(current), Some(retrieved), None) => (current, retrieved),
            _ => return Err(Error::other(format!("Malformed DBINFO reply: {:?}", line))),
        };

        let parse = |token: &str| -> Result<Option<Epoch>> {
            if token == NIL_EPOCH {
                Ok(None)
            } else {
                Epoch::parse(token).map(Some)
            }
        };

        Ok(Self {
            current: parse(current)?,
            retrieved: parse(retrieved)?,
        })
    }
}

impl fmt::Display for EpochInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.current {
            None => write!(f, "{} {}", NIL_EPOCH, NIL_EPOCH),
            Some(current) => match self.retrieved {
                Some(retrieved) => write!(f, "{} {}", current, retrieved),
                None => write!(f, "{} {}", current, NIL_EPOCH),
            },
        }
    }
}

/// Per-shard epoch bookkeeping and counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMachine {
    clock: EpochClock,
    current: Option<Epoch>,
    retrieved: Option<Epoch>,
    periods: PeriodTable,
}

impl StateMachine {
    /// Create an empty state machine
    pub fn new(clock: EpochClock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    /// Get the epoch clock
    pub fn clock(&self) -> EpochClock {
        self.clock
    }

    /// Get the open epoch
    pub fn current(&self) -> Option<Epoch> {
        self.current
    }

    /// Get the last extracted epoch
    pub fn retrieved(&self) -> Option<Epoch> {
        self.retrieved
    }

    /// Get the resident periods
    pub fn periods(&self) -> &PeriodTable {
        &self.periods
    }

    /// Apply one command at logical time `now`
    pub fn apply(&mut self, now: DateTime<Utc>, command: &Command) -> Result<Reply> {
        let result = match command {
            Command::Incr {
                domain,
                delivered,
                bounced,
            } => self
                .increment(now, domain, *delivered, *bounced)
                .map(|_| Reply::Ok),
            Command::Extract { epoch } => self.extract(*epoch).map(|tuples| Reply::Tuples(flatten(&tuples))),
            Command::Scan { epoch } => Ok(Reply::Tuples(flatten(&self.scan(*epoch)))),
            Command::DbInfo => Ok(Reply::Info(self.info().to_string())),
            Command::Ping => Ok(Reply::Pong),
        };

        if let Err(ref e) = result {
            debug!(command = command.name(), error = %e, "command rejected");
        }

        result
    }

    /// Parse and apply a raw command
    pub fn execute<S: AsRef<str>>(&mut self, now: DateTime<Utc>, args: &[S]) -> Result<Reply> {
        let command = Command::parse(args)?;
        self.apply(now, &command)
    }

    /// Add deltas to a domain's counters in the epoch containing `now`
    pub fn increment(&mut self, now: DateTime<Utc>, domain: &str, delivered: i64, bounced: i64) -> Result<()> {
        if domain.is_empty() {
            return Err(Error::wrong_arguments("INCR requires a domain name"));
        }
        if delivered < 0 || bounced < 0 {
            return Err(Error::wrong_arguments("INCR counts must be non-negative"));
        }

        let mut epoch = self.clock.epoch_of(&now)?;

        // Never reopen an epoch older than the open one
        if let Some(current) = self.current {
            if epoch < current {
                warn!(%epoch, %current, "logical clock behind the open epoch");
                epoch = current;
            }
        }

        if !self.periods.contains(epoch) {
            if self.retrieved.is_none() {
                self.retrieved = epoch.previous().ok();
            }
            if self.current != Some(epoch) {
                debug!(%epoch, "opened epoch");
            }
        }

        self.periods.increment(epoch, domain, delivered, bounced);
        self.current = Some(epoch);

        Ok(())
    }

    /// Check whether `epoch` may be extracted now
    pub fn can_extract(&self, epoch: Epoch) -> bool {
        let expected = self.retrieved.and_then(|retrieved| retrieved.next().ok());
        self.current != Some(epoch) || expected == Some(epoch)
    }

    /// Read an epoch's counters and release every epoch before it
    pub fn extract(&mut self, epoch: Epoch) -> Result<Vec<DomainCounters>> {
        if !self.can_extract(epoch) {
            return Err(Error::invalid_extraction(format!(
                "Epoch {} is still open and is not the next epoch after {}",
                epoch,
                self.retrieved
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| NIL_EPOCH.to_string())
            )));
        }

        let tuples = self.periods.tuples(epoch);

        let purged = self.periods.purge_before(epoch);
        if purged > 0 {
            debug!(%epoch, purged, "purged epochs before extracted epoch");
        }
        self.retrieved = Some(epoch);

        info!(%epoch, domains = tuples.len(), "extracted epoch");

        Ok(tuples)
    }

    /// Read an epoch's counters without changing any state
    pub fn scan(&self, epoch: Epoch) -> Vec<DomainCounters> {
        self.periods.tuples(epoch)
    }

    /// Get the epoch bookkeeping
    pub fn info(&self) -> EpochInfo {
        EpochInfo {
            current: self.current,
            retrieved: self.retrieved,
        }
    }

    /// Serialize the full state
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        codec::persist(self.current, self.retrieved, &self.periods)
    }

    /// Rebuild a state machine from snapshot bytes
    pub fn from_snapshot(clock: EpochClock, bytes: &[u8]) -> Result<Self> {
        let state = codec::restore(bytes)?;
        Ok(Self {
            clock,
            current: state.current,
            retrieved: state.retrieved,
            periods: state.periods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    // Epoch 1000 with the default 30s buckets
    const T0: i64 = 30_000;

    #[test]
    fn test_incr_then_scan() -> Result<()> {
        let mut machine = StateMachine::default();
        assert_eq!(machine.execute(at(T0), &["INCR", "acme.com", "1", "0"])?, Reply::Ok);
        assert_eq!(machine.execute(at(T0 + 5), &["INCR", "acme.com", "0", "1"])?, Reply::Ok);

        let epoch = Epoch::new(1000).token();
        let reply = machine.execute(at(T0 + 6), &["SCAN", epoch.as_str()])?;
        assert_eq!(reply, Reply::Tuples(vec!["acme.com".into(), "1".into(), "1".into()]));
        Ok(())
    }

    #[test]
    fn test_first_incr_seeds_retrieved() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "a.com", 1, 0)?;

        assert_eq!(machine.current(), Some(Epoch::new(1000)));
        assert_eq!(machine.retrieved(), Some(Epoch::new(999)));

        // Opening the next epoch leaves retrieved alone
        machine.increment(at(T0 + 30), "a.com", 1, 0)?;
        assert_eq!(machine.current(), Some(Epoch::new(1001)));
        assert_eq!(machine.retrieved(), Some(Epoch::new(999)));
        Ok(())
    }

    #[test]
    fn test_dbinfo() -> Result<()> {
        let mut machine = StateMachine::default();
        assert_eq!(machine.execute(at(T0), &["DBINFO"])?, Reply::Info("<nil> <nil>".into()));

        machine.increment(at(T0), "a.com", 1, 0)?;
        let expected = format!("{} {}", Epoch::new(1000), Epoch::new(999));
        assert_eq!(machine.execute(at(T0), &["dbinfo"])?, Reply::Info(expected.clone()));

        let info = EpochInfo::parse(&expected)?;
        assert_eq!(info, machine.info());
        assert_eq!(EpochInfo::parse("<nil> <nil>")?, EpochInfo::default());
        Ok(())
    }

    #[test]
    fn test_extract_current_epoch_once() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "acme.com", 3, 1)?;
        let e0 = Epoch::new(1000);

        // current == e0 and retrieved == previous(e0): allowed
        let tuples = machine.extract(e0)?;
        assert_eq!(tuples, vec![DomainCounters::with_counts("acme.com", 3, 1)]);
        assert_eq!(machine.retrieved(), Some(e0));

        // A second extract of the still-open epoch is rejected
        let before = machine.clone();
        let err = machine.extract(e0).unwrap_err();
        assert!(matches!(err, Error::InvalidExtraction(_)));
        assert_eq!(machine, before);
        Ok(())
    }

    #[test]
    fn test_extract_purges_previous_epoch() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "a.com", 1, 0)?;
        machine.increment(at(T0 + 30), "b.com", 2, 0)?;
        machine.increment(at(T0 + 60), "c.com", 3, 0)?;
        assert_eq!(machine.periods().len(), 3);

        // Epoch 1001 is closed, extracting it releases 1000
        let tuples = machine.extract(Epoch::new(1001))?;
        assert_eq!(tuples, vec![DomainCounters::with_counts("b.com", 2, 0)]);
        assert!(!machine.periods().contains(Epoch::new(1000)));
        assert_eq!(machine.retrieved(), Some(Epoch::new(1001)));
        assert_eq!(machine.periods().len(), 2);

        // Re-extracting a closed epoch returns the same tuples
        assert_eq!(machine.extract(Epoch::new(1001))?, tuples);
        Ok(())
    }

    #[test]
    fn test_extract_after_quiet_gap_purges_all_older_epochs() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "a.com", 1, 0)?;
        machine.extract(Epoch::new(999))?;
        machine.increment(at(T0 + 30), "a.com", 1, 0)?;
        machine.extract(Epoch::new(1000))?;

        // Nothing arrives during 1002 and 1003
        machine.increment(at(T0 + 120), "a.com", 1, 0)?;
        assert_eq!(machine.periods().len(), 3);

        assert!(machine.extract(Epoch::new(1003))?.is_empty());
        assert_eq!(machine.periods().epochs().collect::<Vec<_>>(), vec![Epoch::new(1004)]);
        assert_eq!(machine.retrieved(), Some(Epoch::new(1003)));
        Ok(())
    }

    #[test]
    fn test_extract_missing_epoch_is_empty() -> Result<()> {
        let mut machine = StateMachine::default();
        assert!(machine.extract(Epoch::new(5))?.is_empty());
        assert_eq!(machine.retrieved(), Some(Epoch::new(5)));

        // Epoch zero has no predecessor to purge
        assert!(machine.extract(Epoch::new(0))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_is_read_only() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "a.com", 1, 0)?;
        let before = machine.clone();

        machine.execute(at(T0 + 90), &["SCAN", "0"])?;
        machine.execute(at(T0 + 90), &["SCAN", Epoch::new(1000).token().as_str()])?;
        assert_eq!(machine, before);
        Ok(())
    }

    #[test]
    fn test_wrong_arguments() {
        let mut machine = StateMachine::default();
        let cases: Vec<Vec<&str>> = vec![
            vec![],
            vec!["INCR", "a.com", "1"],
            vec!["INCR", "a.com", "1", "0", "extra"],
            vec!["INCR", "", "1", "0"],
            vec!["INCR", "a.com", "x", "0"],
            vec!["INCR", "a.com", "1", "-1"],
            vec!["EXTRACT"],
            vec!["SCAN"],
            vec!["DBINFO", "extra"],
        ];
        for args in cases {
            let err = machine.execute(at(T0), &args).unwrap_err();
            assert!(matches!(err, Error::WrongArguments(_)), "args {:?}", args);
        }
        assert_eq!(machine, StateMachine::default());

        assert!(matches!(
            machine.execute(at(T0), &["FLUSHALL"]).unwrap_err(),
            Error::UnknownCommand(_)
        ));
        assert!(matches!(
            machine.execute(at(T0), &["SCAN", "not-an-epoch"]).unwrap_err(),
            Error::InvalidEpoch(_)
        ));
    }

    #[test]
    fn test_clock_behind_current_counts_into_current() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0 + 30), "a.com", 1, 0)?;
        machine.increment(at(T0), "a.com", 1, 0)?;

        assert_eq!(machine.current(), Some(Epoch::new(1001)));
        assert_eq!(machine.scan(Epoch::new(1001)), vec![DomainCounters::with_counts("a.com", 2, 0)]);
        assert!(machine.scan(Epoch::new(1000)).is_empty());
        Ok(())
    }

    #[test]
    fn test_command_args_round_trip() -> Result<()> {
        let commands = vec![
            Command::Incr {
                domain: "a.com".into(),
                delivered: 1,
                bounced: 0,
            },
            Command::Extract { epoch: Epoch::new(9) },
            Command::Scan { epoch: Epoch::new(10) },
            Command::DbInfo,
            Command::Ping,
        ];
        for command in commands {
            assert_eq!(Command::parse(&command.to_args())?, command);
        }
        Ok(())
    }

    #[test]
    fn test_snapshot_round_trip() -> Result<()> {
        let mut machine = StateMachine::default();
        machine.increment(at(T0), "a.com", 4, 0)?;
        machine.increment(at(T0 + 30), "b.com", 0, 2)?;
        machine.extract(Epoch::new(1000))?;

        let restored = StateMachine::from_snapshot(machine.clock(), &machine.snapshot()?)?;
        assert_eq!(restored, machine);

        let empty = StateMachine::default();
        assert_eq!(StateMachine::from_snapshot(empty.clock(), &empty.snapshot()?)?, empty);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_counters_are_order_independent(
            mut deltas in proptest::collection::vec((0usize..3, 0i64..50, 0i64..50), 1..40),
            seed in any::<u64>(),
        ) {
            let names = ["a.com", "b.com", "c.com"];
            let apply = |deltas: &[(usize, i64, i64)]| {
                let mut machine = StateMachine::default();
                for (i, delivered, bounced) in deltas {
                    machine.increment(at(T0), names[*i], *delivered, *bounced).unwrap();
                }
                machine.scan(Epoch::new(1000))
            };

            let forward = apply(&deltas);
            let shift = (seed % deltas.len() as u64) as usize;
            deltas.rotate_left(shift);
            deltas.reverse();
            prop_assert_eq!(apply(&deltas), forward.clone());

            for counters in &forward {
                let idx = names.iter().position(|n| *n == counters.name).unwrap();
                let delivered: i64 = deltas.iter().filter(|d| d.0 == idx).map(|d| d.1).sum();
                let bounced: i64 = deltas.iter().filter(|d| d.0 == idx).map(|d| d.2).sum();
                prop_assert_eq!(counters.delivered, delivered);
                prop_assert_eq!(counters.bounced, bounced);
            }
        }

        #[test]
        fn prop_at_most_two_epochs_when_each_closed_epoch_is_extracted(
            steps in proptest::collection::vec((0i64..4, 1usize..4), 1..20),
        ) {
            let mut machine = StateMachine::default();
            let mut now = T0;
            for (advance, writes) in steps {
                now += advance * 30;
                for _ in 0..writes {
                    machine.increment(at(now), "a.com", 1, 0).unwrap();
                }
                // The master collects the most recently closed epoch
                let target = machine.clock().epoch_of(&at(now)).unwrap().previous().unwrap();
                machine.extract(target).unwrap();
                prop_assert!(machine.periods().len() <= 2);
                prop_assert_eq!(machine.retrieved(), Some(target));
            }
        }
    }
}
