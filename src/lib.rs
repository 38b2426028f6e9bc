pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use config::AppConfig;
pub use db::{create_pool, PgStore};
pub use error::{SyncError, SyncResult};
pub use service::SyncEngine;
