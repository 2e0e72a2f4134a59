//! Constants used throughout the link core
//! This module contains the fixed identity of the sensor glove: its address,
//! the GATT service it exposes, the flex characteristic UUIDs and timeouts.

use uuid::Uuid;

/// Hardware address of the glove peripheral
pub const GLOVE_DEVICE_ADDRESS: &str = "94:B5:55:2C:C9:C2";

/// The UUID of the glove sensor service
pub const UUID_GLOVE_SERVICE: Uuid = Uuid::from_u128(0xf020f474_36c6_4f9f_9fa5_9736ee68a8f9);

/// Flex sensor characteristic UUIDs, one per finger
pub const UUID_THUMB_FLEX: Uuid = Uuid::from_u128(0xffd6cbd5_28fc_4fc7_8760_b74e93f1a73d);
pub const UUID_INDEX_FLEX: Uuid = Uuid::from_u128(0xeb359b0e_fd69_4cfb_ad0d_9b4d4c3f83db);
pub const UUID_MIDDLE_FLEX: Uuid = Uuid::from_u128(0xfe3dae39_d576_4cd7_86e2_05b374258f20);
pub const UUID_RING_FLEX: Uuid = Uuid::from_u128(0xc18ca83e_8cba_4a57_811e_a5de911ffd41);
pub const UUID_PINKY_FLEX: Uuid = Uuid::from_u128(0xb713cb87_4234_4ac8_af57_86cf72fdbc1a);

/// Scan window in seconds before giving up on the glove
pub const DEFAULT_SCAN_PERIOD_SECS: u64 = 10;

/// Delay before a read the transport refused is reported back as failed
pub const DEFAULT_READ_FAILURE_BACKOFF_MS: u64 = 50;

/// Transport status code for an internal GATT fault
pub const GATT_INTERNAL_ERROR: u16 = 129;

/// Generic transport status code for a failed operation
pub const GATT_FAILURE: u16 = 257;
