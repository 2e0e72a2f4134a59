//! Core functionality for the glove link
//! This module contains everything that talks to the glove over Bluetooth LE.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{GloveLink, LinkManager};
