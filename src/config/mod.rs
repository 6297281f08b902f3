mod settings;

pub use settings::{BackplaneSettings, ServerConfig, Settings};
