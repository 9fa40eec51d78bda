pub mod hub;
pub mod settings;

pub use hub::{BackendConfig, HubConfig, HubConfigBuilder, OverflowPolicy, StreamConfig};
pub use settings::{BackendKind, HubSettings, Settings};
