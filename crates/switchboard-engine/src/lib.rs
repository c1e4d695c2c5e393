pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod rotation;
pub mod selector;

pub use config::{AccountConfig, ConfigError, GatewayConfig, ProviderConfig};
pub use orchestrator::{Orchestrator, ProviderRoute, RequestFailure, RequestOutcome};
pub use registry::{AccountRegistry, InMemoryRegistry, DEFAULT_QUOTA_COOLDOWN};
pub use rotation::RotationState;
pub use selector::{order_candidates, AccountSelector, SelectionInput};
