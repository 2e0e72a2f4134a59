//! Characteristic catalog
//! Fixed mapping from sensor identity to characteristic UUID for one glove profile.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_INDEX_FLEX, UUID_MIDDLE_FLEX, UUID_PINKY_FLEX, UUID_RING_FLEX, UUID_THUMB_FLEX,
};

/// Semantic identity of one sensor channel on the glove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    ThumbFlex,
    IndexFlex,
    MiddleFlex,
    RingFlex,
    PinkyFlex,
    AccelX,
    AccelY,
    AccelZ,
    GyroX,
    GyroY,
    GyroZ,
}

impl SensorChannel {
    pub const FLEX: [SensorChannel; 5] = [
        Self::ThumbFlex,
        Self::IndexFlex,
        Self::MiddleFlex,
        Self::RingFlex,
        Self::PinkyFlex,
    ];

    pub const IMU: [SensorChannel; 6] = [
        Self::AccelX,
        Self::AccelY,
        Self::AccelZ,
        Self::GyroX,
        Self::GyroY,
        Self::GyroZ,
    ];

    /// Short upper-case label used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            Self::ThumbFlex => "THUMB",
            Self::IndexFlex => "INDEX",
            Self::MiddleFlex => "MIDDLE",
            Self::RingFlex => "RING",
            Self::PinkyFlex => "PINKY",
            Self::AccelX => "ACCEL-X",
            Self::AccelY => "ACCEL-Y",
            Self::AccelZ => "ACCEL-Z",
            Self::GyroX => "GYRO-X",
            Self::GyroY => "GYRO-Y",
            Self::GyroZ => "GYRO-Z",
        }
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One `{uuid, channel}` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub uuid: Uuid,
    pub channel: SensorChannel,
}

impl CatalogEntry {
    pub const fn new(uuid: Uuid, channel: SensorChannel) -> Self {
        Self { uuid, channel }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog has no entries")]
    Empty,
    #[error("characteristic {0} appears more than once in the catalog")]
    DuplicateUuid(Uuid),
}

/// The validated set of characteristics for the active profile.
///
/// UUIDs are pairwise distinct, so every UUID resolves to exactly one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.uuid == entry.uuid) {
                return Err(CatalogError::DuplicateUuid(entry.uuid));
            }
        }
        Ok(Self { entries })
    }

    /// The five-channel flex glove
    pub fn flex_glove() -> Self {
        Self {
            entries: Self::flex_entries().to_vec(),
        }
    }

    pub const fn flex_entries() -> [CatalogEntry; 5] {
        [
            CatalogEntry::new(UUID_THUMB_FLEX, SensorChannel::ThumbFlex),
            CatalogEntry::new(UUID_INDEX_FLEX, SensorChannel::IndexFlex),
            CatalogEntry::new(UUID_MIDDLE_FLEX, SensorChannel::MiddleFlex),
            CatalogEntry::new(UUID_RING_FLEX, SensorChannel::RingFlex),
            CatalogEntry::new(UUID_PINKY_FLEX, SensorChannel::PinkyFlex),
        ]
    }

    /// The flex glove extended with IMU axes
    pub fn with_imu(imu: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut entries = Self::flex_entries().to_vec();
        entries.extend(imu);
        Self::new(entries)
    }

    pub fn single(entry: CatalogEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn channel_for(&self, uuid: &Uuid) -> Option<SensorChannel> {
        self.entries
            .iter()
            .find(|e| e.uuid == *uuid)
            .map(|e| e.channel)
    }

    pub fn contains_channel(&self, channel: SensorChannel) -> bool {
        self.entries.iter().any(|e| e.channel == channel)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
