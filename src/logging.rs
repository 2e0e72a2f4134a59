use std::io::Write;

use chrono::Local;
use log::{LevelFilter, SetLoggerError};

/// Installs the global logger.
///
/// `level` is the default filter; `RUST_LOG` overrides it per module.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}
