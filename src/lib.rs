//! mailrag - email ingestion and question answering
//!
//! Pulls mail from an IMAP inbox over a date range, keeps it in SQLite with a
//! full-text index, embeds and analyses it through external AI providers,
//! stores the vectors in Qdrant and answers questions about it over HTTP.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

pub use config::config;
pub use error::{Error, Result};
pub use state::AppState;
