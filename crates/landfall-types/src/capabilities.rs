//! Destination capability contract.
//!
//! Each connector declares one [`DestinationCapabilities`] value. The client
//! validates it once at construction and checks optional features against it
//! there, never at call time.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DestinationError, Result};

/// Resolution of timestamp and time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

impl TimestampUnit {
    /// Fixed precision table: 0 = s, 3 = ms, 6 = us, 9 = ns.
    #[must_use]
    pub fn from_precision(precision: u32) -> Option<Self> {
        match precision {
            0 => Some(Self::Second),
            3 => Some(Self::Millisecond),
            6 => Some(Self::Microsecond),
            9 => Some(Self::Nanosecond),
            _ => None,
        }
    }

    #[must_use]
    pub fn precision(self) -> u32 {
        match self {
            Self::Second => 0,
            Self::Millisecond => 3,
            Self::Microsecond => 6,
            Self::Nanosecond => 9,
        }
    }
}

/// Optional destination features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Schema and pipeline state are persisted in destination tables.
    StateSync,
    /// Tables flagged for embedding receive a vector column.
    Embeddings,
    /// Replace can load into a staging table and swap it in.
    StagingReplace,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StateSync => "state_sync",
            Self::Embeddings => "embeddings",
            Self::StagingReplace => "staging_replace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCapabilities {
    /// Default (precision, scale) for decimals declared without one.
    pub decimal_precision: (u32, u32),
    /// The (precision, scale) pair that identifies a wei column.
    pub wei_precision: (u32, u32),
    /// One of 0, 3, 6, 9.
    pub timestamp_precision: u32,
    pub case_sensitive_identifiers: bool,
    pub max_identifier_length: usize,
    pub features: BTreeSet<Capability>,
}

impl DestinationCapabilities {
    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for an unknown timestamp precision, a scale
    /// larger than its precision, or a zero identifier length.
    pub fn validate(&self) -> Result<()> {
        if TimestampUnit::from_precision(self.timestamp_precision).is_none() {
            return Err(DestinationError::config(
                "INVALID_CAPABILITIES",
                format!(
                    "timestamp precision {} is not one of 0, 3, 6, 9",
                    self.timestamp_precision
                ),
            ));
        }
        for (label, (precision, scale)) in [
            ("decimal", self.decimal_precision),
            ("wei", self.wei_precision),
        ] {
            if scale > precision {
                return Err(DestinationError::config(
                    "INVALID_CAPABILITIES",
                    format!("{label} scale {scale} exceeds precision {precision}"),
                ));
            }
        }
        if self.max_identifier_length == 0 {
            return Err(DestinationError::config(
                "INVALID_CAPABILITIES",
                "max identifier length must be positive",
            ));
        }
        Ok(())
    }

    /// Unit derived from [`Self::timestamp_precision`], microseconds if invalid.
    #[must_use]
    pub fn timestamp_unit(&self) -> TimestampUnit {
        TimestampUnit::from_precision(self.timestamp_precision)
            .unwrap_or(TimestampUnit::Microsecond)
    }

    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.features.contains(&capability)
    }

    /// # Errors
    ///
    /// Returns a `config` error naming the missing capability.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(DestinationError::config(
                "MISSING_CAPABILITY",
                format!("destination does not support {capability}"),
            ))
        }
    }

    #[must_use]
    pub fn with_feature(mut self, capability: Capability) -> Self {
        self.features.insert(capability);
        self
    }

    #[must_use]
    pub fn without_feature(mut self, capability: Capability) -> Self {
        self.features.remove(&capability);
        self
    }
}

impl Default for DestinationCapabilities {
    fn default() -> Self {
        Self {
            decimal_precision: (38, 9),
            wei_precision: (38, 0),
            timestamp_precision: 6,
            case_sensitive_identifiers: false,
            max_identifier_length: 255,
            features: BTreeSet::from([Capability::StateSync]),
        }
    }
}
