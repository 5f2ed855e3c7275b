//! Durable storage — the identity ledger lives in SQLite.
//! Generated artifacts never touch the database; see `custodian`.

pub mod db;

pub use db::{create_pool, get_connection, DbConnection, DbPool};
