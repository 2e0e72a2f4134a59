pub mod link_config;

pub use link_config::LinkConfig;

/// Used when neither `GLOVE_LINK_CONFIG` nor a command line argument names a file
pub const DEFAULT_CONFIG_PATH: &str = "config/link_config.json";

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "GLOVE_LINK_CONFIG";
