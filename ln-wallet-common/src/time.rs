//! Millisecond-resolution, non-negative timestamps.
//!
//! `spec.md`'s `WalletReady` event and the payment receiver's timeout
//! bookkeeping both want "wall clock time" without pulling in a full
//! date/time crate; a plain non-negative millisecond count since the epoch
//! is all either needs.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

/// Milliseconds since the Unix epoch. Always non-negative: constructing one
/// from a `SystemTime` earlier than the epoch is a programmer error, not a
/// recoverable condition, so that path returns an `anyhow::Error`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).expect("system clock is before the Unix epoch")
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        (millis >= 0).then_some(Self(millis))
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn as_millis(self) -> u64 {
        self.0 as u64
    }
}

impl From<TimestampMs> for SystemTime {
    fn from(ts: TimestampMs) -> Self {
        UNIX_EPOCH + std::time::Duration::from_millis(ts.0 as u64)
    }
}

impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(time: SystemTime) -> anyhow::Result<Self> {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .context("SystemTime predates the Unix epoch")?
            .as_millis();
        i64::try_from(millis)
            .context("timestamp does not fit in i64 milliseconds")
            .map(Self)
    }
}

impl serde::Serialize for TimestampMs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for TimestampMs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Self::from_millis(millis)
            .ok_or_else(|| serde::de::Error::custom("timestamp millis must be non-negative"))
    }
}
