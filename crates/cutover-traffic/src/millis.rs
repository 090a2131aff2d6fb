//! `Duration` as integer milliseconds in config and persisted records
//!
//! Use with `#[serde(with = "cutover_traffic::millis")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize as whole milliseconds, saturating at `u64::MAX`
///
/// # Errors
/// Whatever the serializer reports
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Deserialize from whole milliseconds
///
/// # Errors
/// When the input is not an unsigned integer
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// The same encoding for lists of durations
pub mod list {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize each entry as whole milliseconds
    ///
    /// # Errors
    /// Whatever the serializer reports
    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&u64::try_from(value.as_millis()).unwrap_or(u64::MAX))?;
        }
        seq.end()
    }

    /// Deserialize a list of whole milliseconds
    ///
    /// # Errors
    /// When the input is not a list of unsigned integers
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<u64>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(Duration::from_millis).collect())
    }
}
