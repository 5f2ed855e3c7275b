//! talkreg - Self-registration portal for TeamTalk 5 servers
//!
//! This library provides all the functionality of the registration portal:
//! the Telegram and web front-ends, the registration orchestrator, the
//! TeamTalk server gateway and the artifact pipeline.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, input validation
//! - `storage`: the SQLite identity ledger
//! - `gateway`: TeamTalk 5 TCP client and account provisioning
//! - `artifact`: `.tt` descriptors, `tt://` links, client archives
//! - `custodian`: token-addressed temporary artifact storage
//! - `orchestrator`: the registration state machine shared by front-ends
//! - `telegram`: the Telegram bot front-end
//! - `web`: the HTML form front-end

pub mod artifact;
pub mod cli;
pub mod core;
pub mod custodian;
pub mod gateway;
pub mod i18n;
pub mod orchestrator;
pub mod storage;
pub mod telegram;
pub mod web;

// Re-export commonly used types for convenience
pub use crate::core::{config, init_logger, AppError, AppResult, Config};
pub use crate::custodian::{Custodian, RetrievalToken};
pub use crate::gateway::{DirectoryGateway, TeamTalkGateway};
pub use crate::orchestrator::{Registrar, RegistrationOutcome, RegistrationRequest};
pub use crate::storage::{create_pool, get_connection, DbConnection, DbPool};
