pub mod database; // Engine provisioning and per-dialect introspection
pub mod export;
pub mod history;
pub mod llm_service;
pub mod metadata_cache;
pub mod query_service;

pub use database::{EngineHandle, EngineMode, EngineProvisioner, EngineSettings};
pub use export::*;
pub use history::*;
pub use llm_service::*;
pub use metadata_cache::*;
pub use query_service::*;
