//! # Configuration Modules
//!
//! Engine settings, loadable from JSON with every field defaulted.

// // Statements: Exporting sub-modules to make them accessible via lib_engagement::configs
/// Connection, retry and timeout settings of one engine.
pub mod engine_config;

pub use engine_config::EngineConfig;
