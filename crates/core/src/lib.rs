//! Shared model, configuration, errors and event bus for the lead-nurture
//! automation engine.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{NurtureError, NurtureResult};
