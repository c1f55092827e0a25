use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", .0)]
    Custom(String),

    #[error("IO::{:?}: {}", .0, .0)]
    Io(#[from] std::io::Error),

    #[error("Logging: {}", .0)]
    Logging(String),

    #[error("Config: {}", .0)]
    Config(#[from] credlease_core::config::ConfigError),

    #[error("Database: {}", .0)]
    Db(#[from] sqlx::Error),

    #[error("Migration: {}", .0)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Store: {}", .0)]
    Store(#[from] credlease_core::store::StoreError),

    #[error("Refresh: {}", .0)]
    Refresh(#[from] credlease_core::refresh::RefreshError),

    #[error("Json: {}", .0)]
    Json(#[from] serde_json::Error),
}
