//! Core utilities: configuration, errors, logging, validation.

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use logging::init_logger;
