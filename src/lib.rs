//! Glove link library
//! Host-side Bluetooth LE central that connects to the sensor glove and polls
//! its flex sensors, one characteristic read at a time.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;
