//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::constants::{GATT_INTERNAL_ERROR, GLOVE_DEVICE_ADDRESS};

fn mac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").expect("MAC pattern is valid")
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("not a hardware address: {0:?}")]
    Malformed(String),
}

/// A hardware address in the canonical `AA:BB:CC:DD:EE:FF` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Pulls the last MAC address out of a platform device identifier,
    /// e.g. a BlueZ object path ending in `dev_94_B5_55_2C_C9_C2`.
    pub fn extract(device_id: &str) -> Option<Self> {
        mac_pattern()
            .find_iter(device_id)
            .last()
            .map(|m| Self::canonical(m.as_str()))
    }

    /// Address of the built-in glove profile
    pub fn glove() -> Self {
        Self::canonical(GLOVE_DEVICE_ADDRESS)
    }

    fn canonical(raw: &str) -> Self {
        Self(raw.replace(['-', '_'], ":").to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match mac_pattern().find(trimmed) {
            Some(m) if m.start() == 0 && m.end() == trimmed.len() => {
                Ok(Self::canonical(trimmed))
            }
            _ => Err(AddressError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed identity of the peripheral this link talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// The address the scanner filters on
    pub address: DeviceAddress,
    /// Services that must all be present after discovery
    pub services: Vec<Uuid>,
}

impl DeviceDescriptor {
    pub fn new(address: DeviceAddress, services: Vec<Uuid>) -> Self {
        Self { address, services }
    }
}

/// Opaque reference to one transport-level link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Completion status reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Transport-level internal fault (wire code 129)
    InternalError,
    Failure(u16),
}

impl GattStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Success => 0,
            Self::InternalError => GATT_INTERNAL_ERROR,
            Self::Failure(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::InternalError => write!(f, "internal error ({})", self.code()),
            Self::Failure(_) => write!(f, "failure ({})", self.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A service as reported by discovery, with its characteristics in discovery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// A received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}
