//! hub-core: routing config, wire models and site layout shared by the
//! piggyback hub daemon and its control tool.

pub mod message;
pub mod paths;
pub mod retry;
pub mod settings;
pub mod store;

pub use message::{ConfigMessage, ConfigType, HostName, PiggybackPayload, RoutingConfig, SiteId};
pub use retry::RetryPolicy;
pub use settings::HubSettings;
