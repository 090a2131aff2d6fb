//! Old/new traffic split

use crate::error::TrafficError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Percentage of requests routed to each environment
///
/// The only constructors enforce `old + new == 100`, including
/// deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWeight")]
pub struct TrafficWeight {
    old: u8,
    new: u8,
}

#[derive(Deserialize)]
struct RawWeight {
    old: u8,
    new: u8,
}

impl TryFrom<RawWeight> for TrafficWeight {
    type Error = TrafficError;

    fn try_from(raw: RawWeight) -> Result<Self, Self::Error> {
        Self::new(raw.old, raw.new)
    }
}

impl TrafficWeight {
    /// Everything on the old environment
    pub const ALL_OLD: Self = Self { old: 100, new: 0 };

    /// Everything on the new environment
    pub const ALL_NEW: Self = Self { old: 0, new: 100 };

    /// Build a split
    ///
    /// # Errors
    /// `InvalidWeight` unless `old + new == 100`
    pub fn new(old: u8, new: u8) -> Result<Self, TrafficError> {
        if u16::from(old) + u16::from(new) != 100 {
            return Err(TrafficError::InvalidWeight { old, new });
        }
        Ok(Self { old, new })
    }

    /// Split with `new` percent on the new environment
    ///
    /// # Errors
    /// `InvalidWeight` if `new > 100`
    pub fn with_new_share(new: u8) -> Result<Self, TrafficError> {
        let old = 100u8
            .checked_sub(new)
            .ok_or(TrafficError::InvalidWeight { old: 0, new })?;
        Self::new(old, new)
    }

    /// Old environment share
    #[inline]
    #[must_use]
    pub fn old(self) -> u8 {
        self.old
    }

    /// New environment share
    #[inline]
    #[must_use]
    pub fn new_share(self) -> u8 {
        self.new
    }
}

impl fmt::Display for TrafficWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.old, self.new)
    }
}
