//! Relay between BigQuery remote functions and the Vault Transform secret
//! engine.
//!
//! `POST /encrypt` and `POST /decrypt` take a remote function batch and
//! answer with one reply per call, in call order. Each value is sent to
//! Vault individually; values Vault refuses come back as `null`.

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod transform;

pub use api::{AppState, build_router};
pub use batch::{BatchReply, BatchRequest};
pub use config::{Args, ServerConfig, VaultConfig};
pub use error::{ApiError, ConfigError, TransformError, TransformResult};
pub use transform::{TransformBackend, TransformOp, VaultTransformClient};
