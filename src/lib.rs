pub mod action_schema;
pub mod config;
pub mod controller;
pub mod coordinates;
pub mod error;
pub mod executor;
pub mod llm_gateway;
pub mod orchestrator;
pub mod recorder;
pub mod session_store;
pub mod vision_client;
pub mod visual_driver;
pub mod visual_verification;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(test)]
mod test_support;

pub use error::{EngineError, EngineResult};
