//! Shared types for the kubeimage cluster-image engine.

pub mod cancel;
pub mod config;
pub mod error;
pub mod platform;

pub use cancel::CancelFlag;
pub use config::{EngineConfig, NameDefaults};
pub use error::{EngineError, Result};
pub use platform::Platform;
