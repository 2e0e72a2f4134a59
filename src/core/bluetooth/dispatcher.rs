//! Value dispatching
//! Decodes completed reads and forwards them to the sink registered for the
//! characteristic's channel.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::catalog::{Catalog, SensorChannel};

/// Receives every decoded value for one channel
pub trait ChannelSink: Send + 'static {
    fn deliver(&self, value: String);
}

impl<F> ChannelSink for F
where
    F: Fn(String) + Send + 'static,
{
    fn deliver(&self, value: String) {
        self(value)
    }
}

/// A decoded value tagged with its channel, for consumers that want one stream
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub channel: SensorChannel,
    pub value: String,
    pub received_at: DateTime<Local>,
}

/// Builds a sink that forwards readings for `channel` onto `tx`
pub fn reading_sink(
    channel: SensorChannel,
    tx: mpsc::UnboundedSender<SensorReading>,
) -> impl ChannelSink {
    move |value: String| {
        let reading = SensorReading {
            channel,
            value,
            received_at: Local::now(),
        };
        if tx.send(reading).is_err() {
            trace!("Reading receiver for {} is gone", channel);
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel {0} is not part of the active catalog")]
    UnknownChannel(SensorChannel),
}

/// What happened to one dispatched value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Delivered(SensorChannel),
    /// Known channel, nobody listening
    NoSink(SensorChannel),
    UnknownCharacteristic,
}

/// Interprets a characteristic value as text starting at offset 0.
/// Trailing NUL padding from C-string firmware is dropped.
pub fn decode_text(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

pub struct ValueDispatcher {
    catalog: Catalog,
    sinks: HashMap<SensorChannel, Box<dyn ChannelSink>>,
}

impl ValueDispatcher {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            sinks: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Registers `sink` for `channel`, replacing any earlier one
    pub fn register(
        &mut self,
        channel: SensorChannel,
        sink: impl ChannelSink,
    ) -> Result<(), DispatchError> {
        if !self.catalog.contains_channel(channel) {
            return Err(DispatchError::UnknownChannel(channel));
        }
        if self.sinks.insert(channel, Box::new(sink)).is_some() {
            debug!("Replaced sink for {}", channel);
        }
        Ok(())
    }

    /// Forwards one value synchronously; no buffering or rate limiting
    pub fn dispatch(&self, characteristic: &Uuid, payload: &[u8]) -> Dispatched {
        let Some(channel) = self.catalog.channel_for(characteristic) else {
            debug!("Unknown characteristic {}", characteristic);
            return Dispatched::UnknownCharacteristic;
        };
        let value = decode_text(payload);
        debug!("{}: {}", channel, value);
        match self.sinks.get(&channel) {
            Some(sink) => {
                sink.deliver(value);
                Dispatched::Delivered(channel)
            }
            None => {
                warn!("No sink registered for {}, dropping value", channel);
                Dispatched::NoSink(channel)
            }
        }
    }
}
