pub mod error;
pub mod health;
pub mod service;
pub mod tools;


pub use error::DomainError;
pub use health::{HealthProber, ProbeFailure, ProbeOutcome};
pub use service::{RegistrySettings, ServiceRegistryService};
pub use tools::{ToolsCatalog, ToolsProxy};
