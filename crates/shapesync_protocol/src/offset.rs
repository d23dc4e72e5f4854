//! Log cursors and shape handles.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A cursor into one shape's log.
///
/// Offsets are only comparable within a single [`ShapeHandle`]. Two sentinel
/// values exist: [`Offset::Initial`] (`-1`, read the log from the beginning)
/// and [`Offset::Now`] (`now`, skip history and only receive new changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Start of the log (`-1`).
    Initial,
    /// Skip history (`now`).
    Now,
    /// A concrete position `<tx>_<op>`.
    Log {
        /// Transaction component.
        tx: u64,
        /// Operation index within the transaction.
        op: u64,
    },
}

impl Offset {
    /// Creates a concrete log offset.
    pub fn log(tx: u64, op: u64) -> Self {
        Self::Log { tx, op }
    }

    /// Returns true for the `-1` sentinel.
    pub fn is_initial(&self) -> bool {
        matches!(self, Offset::Initial)
    }

    /// Returns true if `self` is strictly behind `other` in the same log.
    ///
    /// Returns false when the two offsets are not comparable.
    pub fn is_before(&self, other: &Offset) -> bool {
        self.partial_cmp(other) == Some(Ordering::Less)
    }
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Initial
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use Offset::*;
        match (self, other) {
            (Initial, Initial) | (Now, Now) => Some(Ordering::Equal),
            (Initial, Log { .. }) => Some(Ordering::Less),
            (Log { .. }, Initial) => Some(Ordering::Greater),
            (Log { tx: a, op: b }, Log { tx: c, op: d }) => Some((a, b).cmp(&(c, d))),
            // `now` resolves to a server-side position we do not know yet
            (Now, _) | (_, Now) => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Initial => f.write_str("-1"),
            Offset::Now => f.write_str("now"),
            Offset::Log { tx, op } => write!(f, "{tx}_{op}"),
        }
    }
}

impl FromStr for Offset {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "-1" => Ok(Offset::Initial),
            "now" => Ok(Offset::Now),
            _ => {
                let (tx, op) = s
                    .split_once('_')
                    .ok_or_else(|| ProtocolError::InvalidOffset(s.to_string()))?;
                let tx = tx
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::InvalidOffset(s.to_string()))?;
                let op = op
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::InvalidOffset(s.to_string()))?;
                Ok(Offset::Log { tx, op })
            }
        }
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Server-assigned identifier of a shape definition and its log generation.
///
/// A new handle invalidates every offset obtained under the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeHandle(String);

impl ShapeHandle {
    /// Wraps a raw handle string.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a placeholder handle used when a 409 response names no successor.
    pub fn successor(&self) -> Self {
        Self(format!("{}-next", self.0))
    }
}

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeHandle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ShapeHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sentinels() {
        assert_eq!("-1".parse::<Offset>().unwrap(), Offset::Initial);
        assert_eq!("now".parse::<Offset>().unwrap(), Offset::Now);
        assert_eq!("26800584_4".parse::<Offset>().unwrap(), Offset::log(26800584, 4));
    }

    #[test]
    fn parse_rejects_garbage() {
        for raw in ["", "abc", "1_", "_1", "1_2_3", "-2", "1-2"] {
            assert!(raw.parse::<Offset>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(Offset::Initial.to_string(), "-1");
        assert_eq!(Offset::Now.to_string(), "now");
        assert_eq!(Offset::log(7, 0).to_string(), "7_0");
    }

    #[test]
    fn ordering_within_a_log() {
        assert!(Offset::Initial.is_before(&Offset::log(0, 0)));
        assert!(Offset::log(1, 9).is_before(&Offset::log(2, 0)));
        assert!(Offset::log(2, 0).is_before(&Offset::log(2, 1)));
        assert!(!Offset::log(2, 1).is_before(&Offset::log(2, 1)));
    }

    #[test]
    fn now_is_not_comparable() {
        assert_eq!(Offset::Now.partial_cmp(&Offset::log(1, 1)), None);
        assert!(!Offset::Now.is_before(&Offset::Initial));
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&Offset::log(3, 4)).unwrap();
        assert_eq!(json, "\"3_4\"");
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Offset::log(3, 4));
    }

    #[test]
    fn handle_successor() {
        let handle = ShapeHandle::new("123-456");
        assert_eq!(handle.successor().as_str(), "123-456-next");
    }
}
