use std::fmt;

use anyhow::Context;
use chrono::{
    DateTime,
    SecondsFormat,
    SubsecRound,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Millisecond-precision instant in time, serialized as RFC 3339.
///
/// All timestamps that cross the wire (audit log entries, push-channel
/// events, HTTP responses) round-trip through this type so clock precision
/// is consistent everywhere rather than depending on serde's default
/// `DateTime` format.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_system_time(t: std::time::SystemTime) -> Self {
        Self(DateTime::<Utc>::from(t).trunc_subsecs(3))
    }

    pub fn inner(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, floored at 0 (clock
    /// skew or an out-of-order call must never produce negative elapsed
    /// time on the hot path).
    pub fn saturating_millis_since(&self, earlier: &Timestamp) -> i64 {
        (self.0 - earlier.0).num_milliseconds().max(0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&s)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc)
            .trunc_subsecs(3);
        Ok(Self(dt))
    }
}

impl TryFrom<&str> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> anyhow::Result<Self> {
        let dt = DateTime::parse_from_rfc3339(s)
            .context("invalid RFC 3339 timestamp")?
            .with_timezone(&Utc)
            .trunc_subsecs(3);
        Ok(Self(dt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_rfc3339() {
        let ts = Timestamp::now();
        let encoded = ts.to_string();
        let decoded = Timestamp::try_from(encoded.as_str()).unwrap();
        assert_eq!(ts, decoded);
    }

    #[test]
    fn serde_roundtrips() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        let decoded: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, decoded);
    }
}
