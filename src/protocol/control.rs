//! Control messages and the parameters callers build them from.

use crate::error::{AppResult, AutodetectError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Message code for a flush request.
pub const FLUSH_MESSAGE_CODE: char = 'f';
/// Message code for an interim results calculation.
pub const INTERIM_MESSAGE_CODE: char = 'i';
/// Message code for a bucket reset.
pub const RESET_BUCKETS_MESSAGE_CODE: char = 'r';
/// Message code for a configuration update.
pub const UPDATE_MESSAGE_CODE: char = 'u';

/// Inclusive-exclusive range of epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: i64,
    end: i64,
}

impl TimeRange {
    /// Create a range; `start` must not be after `end`.
    pub fn new(start: i64, end: i64) -> AppResult<Self> {
        if start > end {
            return Err(AutodetectError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Range start in epoch seconds
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Range end in epoch seconds
    pub fn end(&self) -> i64 {
        self.end
    }

    fn parse(payload: &str) -> io::Result<Self> {
        let (start, end) = payload
            .split_once(' ')
            .ok_or_else(|| invalid(format!("time range without separator: '{payload}'")))?;
        let start = start
            .parse()
            .map_err(|_| invalid(format!("invalid range start '{start}'")))?;
        let end = end
            .parse()
            .map_err(|_| invalid(format!("invalid range end '{end}'")))?;
        TimeRange::new(start, end).map_err(|e| invalid(e.to_string()))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.start, self.end)
    }
}

/// Whether a flush should first calculate interim results, and over what range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterimResultsParams {
    /// Ask the process for interim results before the flush
    pub calc_interim: bool,
    /// Restrict the calculation to this range
    pub range: Option<TimeRange>,
}

impl InterimResultsParams {
    /// No interim results, plain flush.
    pub fn none() -> Self {
        Self::default()
    }

    /// Calculate interim results for the current bucket.
    pub fn calc_interim() -> Self {
        Self {
            calc_interim: true,
            range: None,
        }
    }

    /// Calculate interim results over an explicit range.
    pub fn calc_interim_over(range: TimeRange) -> Self {
        Self {
            calc_interim: true,
            range: Some(range),
        }
    }
}

/// Per-upload options for `write_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLoadParams {
    /// Buckets in this range are invalidated before the new records are written
    pub reset_range: Option<TimeRange>,
}

impl DataLoadParams {
    /// Plain upload without a reset
    pub fn none() -> Self {
        Self::default()
    }

    /// Upload that first resets the buckets in `range`
    pub fn reset_buckets(range: TimeRange) -> Self {
        Self {
            reset_range: Some(range),
        }
    }

    /// Whether this upload starts with a reset-buckets message
    pub fn is_resetting_buckets(&self) -> bool {
        self.reset_range.is_some()
    }
}

/// A tagged instruction to the native process.
///
/// On the wire each message is the single field of a one-field record: the
/// message code followed by its payload. Padding is a field made only of
/// spaces; the process discards it, but writing it forces the process to
/// drain its input buffer so a preceding flush is seen immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Flush and acknowledge with the given id
    Flush {
        /// Correlation id echoed back in the acknowledgement
        flush_id: String,
    },
    /// Calculate interim results
    CalcInterim {
        /// Optional range to calculate over
        range: Option<TimeRange>,
    },
    /// Invalidate buckets in a range
    ResetBuckets {
        /// Range whose buckets are recomputed
        range: TimeRange,
    },
    /// Apply a configuration update
    UpdateConfig {
        /// Raw configuration text
        config: String,
    },
    /// Blank filler of the given length
    Padding(usize),
}

impl ControlMessage {
    /// Render the control field for this message.
    pub fn to_field(&self) -> String {
        match self {
            ControlMessage::Flush { flush_id } => format!("{FLUSH_MESSAGE_CODE}{flush_id}"),
            ControlMessage::CalcInterim { range: None } => INTERIM_MESSAGE_CODE.to_string(),
            ControlMessage::CalcInterim { range: Some(range) } => {
                format!("{INTERIM_MESSAGE_CODE}{range}")
            }
            ControlMessage::ResetBuckets { range } => {
                format!("{RESET_BUCKETS_MESSAGE_CODE}{range}")
            }
            ControlMessage::UpdateConfig { config } => format!("{UPDATE_MESSAGE_CODE}{config}"),
            ControlMessage::Padding(len) => " ".repeat(*len),
        }
    }

    /// Parse a control field written by [`ControlMessage::to_field`].
    pub fn parse(field: &str) -> io::Result<Self> {
        if field.bytes().all(|b| b == b' ') {
            return Ok(ControlMessage::Padding(field.len()));
        }

        let mut chars = field.chars();
        let code = chars.next().unwrap_or(' ');
        let payload = chars.as_str();
        match code {
            FLUSH_MESSAGE_CODE => Ok(ControlMessage::Flush {
                flush_id: payload.to_string(),
            }),
            INTERIM_MESSAGE_CODE if payload.is_empty() => {
                Ok(ControlMessage::CalcInterim { range: None })
            }
            INTERIM_MESSAGE_CODE => Ok(ControlMessage::CalcInterim {
                range: Some(TimeRange::parse(payload)?),
            }),
            RESET_BUCKETS_MESSAGE_CODE => Ok(ControlMessage::ResetBuckets {
                range: TimeRange::parse(payload)?,
            }),
            UPDATE_MESSAGE_CODE => Ok(ControlMessage::UpdateConfig {
                config: payload.to_string(),
            }),
            other => Err(invalid(format!("unknown control message code '{other}'"))),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Flush { .. } => "flush",
            ControlMessage::CalcInterim { .. } => "calc_interim",
            ControlMessage::ResetBuckets { .. } => "reset_buckets",
            ControlMessage::UpdateConfig { .. } => "update_config",
            ControlMessage::Padding(_) => "padding",
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Source of flush ids for one communicator.
///
/// Ids are a monotonically increasing counter rendered as decimal strings, so
/// every flush sent by one communicator carries a distinct id.
#[derive(Debug)]
pub struct FlushIdGenerator {
    next: AtomicU64,
}

impl FlushIdGenerator {
    /// Generator whose first id is "1"
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Generator whose first id is `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Take the next id.
    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

impl Default for FlushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn time_range_rejects_reversed_bounds() {
        assert!(TimeRange::new(10, 5).is_err());
        assert!(TimeRange::new(5, 5).is_ok());
    }

    #[test]
    fn control_fields_use_message_codes() {
        let range = TimeRange::new(1_359_450_000, 1_359_453_600).unwrap();

        assert_eq!(
            ControlMessage::Flush {
                flush_id: "7".into()
            }
            .to_field(),
            "f7"
        );
        assert_eq!(ControlMessage::CalcInterim { range: None }.to_field(), "i");
        assert_eq!(
            ControlMessage::CalcInterim { range: Some(range) }.to_field(),
            "i1359450000 1359453600"
        );
        assert_eq!(
            ControlMessage::ResetBuckets { range }.to_field(),
            "r1359450000 1359453600"
        );
        assert_eq!(
            ControlMessage::UpdateConfig {
                config: "[modelDebugConfig]\nboundsPercentile = 95.0".into()
            }
            .to_field(),
            "u[modelDebugConfig]\nboundsPercentile = 95.0"
        );
        assert_eq!(ControlMessage::Padding(3).to_field(), "   ");
    }

    #[test]
    fn parse_reads_back_every_kind() {
        let range = TimeRange::new(0, 3600).unwrap();
        let messages = [
            ControlMessage::Flush {
                flush_id: "42".into(),
            },
            ControlMessage::CalcInterim { range: None },
            ControlMessage::CalcInterim { range: Some(range) },
            ControlMessage::ResetBuckets { range },
            ControlMessage::UpdateConfig {
                config: "filters = []".into(),
            },
            ControlMessage::Padding(16),
        ];

        for message in messages {
            assert_eq!(ControlMessage::parse(&message.to_field()).unwrap(), message);
        }
    }

    #[test]
    fn parse_rejects_unknown_code() {
        let err = ControlMessage::parse("x123").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parse_rejects_malformed_range() {
        assert!(ControlMessage::parse("r100").is_err());
        assert!(ControlMessage::parse("rabc 200").is_err());
        assert!(ControlMessage::parse("r300 200").is_err());
    }

    #[test]
    fn flush_ids_start_at_one_and_increase() {
        let ids = FlushIdGenerator::new();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");

        let ids = FlushIdGenerator::starting_at(100);
        assert_eq!(ids.next_id(), "100");
    }

    proptest! {
        #[test]
        fn flush_ids_are_pairwise_distinct(start in 0u64..1_000_000, count in 1usize..500) {
            let ids = FlushIdGenerator::starting_at(start);
            let generated: Vec<String> = (0..count).map(|_| ids.next_id()).collect();
            let unique: HashSet<&String> = generated.iter().collect();
            prop_assert_eq!(unique.len(), count);
        }
    }
}
