use std::path::Path;
use std::time::Duration;

use crate::core::bluetooth::{
    Catalog, CatalogEntry, CatalogError, DEFAULT_READ_FAILURE_BACKOFF_MS,
    DEFAULT_SCAN_PERIOD_SECS, DeviceAddress, DeviceDescriptor, LinkSettings, ScanSettings, UUID_GLOVE_SERVICE,
};
use crate::utils::ensure_directory_exists;
use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// Link settings as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Hardware address of the glove to scan for
    pub device_address: DeviceAddress,
    /// Services that must be present after discovery
    pub service_uuids: Vec<Uuid>,
    pub scan_timeout_secs: u64,
    /// Radio scan parameters handed to the transport
    pub scan: ScanSettings,
    /// Back-off before a refused read is retried as a failed completion
    pub read_failure_backoff_ms: u64,
    pub auto_reconnect: bool,
    /// Characteristic UUID to sensor channel mapping
    pub catalog: Vec<CatalogEntry>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            device_address: DeviceAddress::glove(),
            service_uuids: vec![UUID_GLOVE_SERVICE],
            scan_timeout_secs: DEFAULT_SCAN_PERIOD_SECS,
            scan: ScanSettings::default(),
            read_failure_backoff_ms: DEFAULT_READ_FAILURE_BACKOFF_MS,
            auto_reconnect: true,
            catalog: Catalog::flex_entries().to_vec(),
        }
    }
}

impl LinkConfig {
    /// Loads the config from `path`, falling back to defaults when the file is missing.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref();
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!(
                "Link config file not found at {:?}, using default.",
                file_path_str
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        config.validate()?;

        info!("Link config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to `path`, creating its directory if needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let file_path = path.as_ref();
        if let Some(config_dir) = file_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize link config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Link config saved to {:?}", file_path_str);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.service_uuids.is_empty() {
            return Err(anyhow!("Link config lists no service UUIDs"));
        }
        if self.scan_timeout_secs == 0 {
            return Err(anyhow!("Scan timeout must be at least one second"));
        }
        self.catalog()?;
        Ok(())
    }

    pub fn catalog(&self) -> Result<Catalog, CatalogError> {
        Catalog::new(self.catalog.clone())
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.device_address.clone(), self.service_uuids.clone())
    }

    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            descriptor: self.descriptor(),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            scan: self.scan,
            auto_reconnect: self.auto_reconnect,
            read_failure_backoff: Duration::from_millis(self.read_failure_backoff_ms),
        }
    }
}
