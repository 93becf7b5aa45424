//! presence-store: SQLite persistence for Presence.
//!
//! One database file holds face templates, attendance sessions and the
//! append-only scan log. [`Database`] implements the store traits from
//! `presence-core`; its methods block and are meant to run off the frame
//! loop.

mod db;
mod schema;

pub use db::{Database, DbError};
