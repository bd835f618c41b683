pub mod config;
pub mod error;
pub mod frontmatter;
pub mod health;
pub mod install;
pub mod interaction;
pub mod logs;
pub mod port_alloc;
pub mod readiness;
pub mod registry;
pub mod scaffold;
pub mod supervisor;

mod support;

pub use config::{Settings, TtlPolicy};
pub use error::AgentError;
pub use health::{HealthReport, HealthThresholds};
pub use registry::{Registry, RegistryStats};
