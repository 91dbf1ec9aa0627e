//! # parley-store
//!
//! SQLite implementation of [`parley_core::Store`].

#![deny(unsafe_code)]

pub mod database;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use sqlite::SqliteStore;
