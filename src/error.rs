use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ImportError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("download of {url} returned status {status}")]
    Download { url: String, status: u16 },

    #[error("invalid record: {0}")]
    Validation(String),

    #[error("unresolved parent for {entity} {id}: {reason}")]
    IntegrityGap {
        entity: &'static str,
        id: i64,
        reason: &'static str,
    },

    #[error("bulk insert into {table} failed: {message}")]
    BulkWrite { table: &'static str, message: String },

    #[error("archive {path} is unreadable: {message}")]
    #[diagnostic(help("delete the archive file to force a fresh download"))]
    CorruptArchive { path: PathBuf, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("response cache error: {0}")]
    Cache(String),

    #[error("model '{model}' not found in app '{app}'")]
    #[diagnostic(help("check the model name, e.g. Uf, Municipio, Distrito, Regiao or Empresa"))]
    UnknownTable { app: String, model: String },

    #[error("refusing to delete every row of {0} without --confirm")]
    #[diagnostic(help("this removes ALL data in the table and its dependents; pass --confirm"))]
    ConfirmationRequired(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::Database(err.to_string())
    }
}
