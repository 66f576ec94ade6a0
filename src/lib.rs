//! Registry Watch
//!
//! Change-data-capture for company (OGRN) and individual entrepreneur
//! (OGRNIP) registry records. Each observation cycle compares the current
//! snapshot of an entity with the last known one, turns the differences
//! into ordered change events and persists them idempotently.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
