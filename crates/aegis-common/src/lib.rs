pub mod config;
pub mod logging;

pub const APP_NAME: &str = "AEGIS";

pub use config::{
    AegisConfig, ConfigError, ConfirmationConfig, PanelConfig, RetryConfig, SessionConfig,
};
