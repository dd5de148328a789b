//! Where the SSOT script comes from.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// A source of SSOT DDL text.
#[async_trait]
pub trait SsotSource: Send + Sync {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Loads the script.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Io`](crate::error::MigrateError::Io) when
    /// the script cannot be read.
    async fn read(&self) -> Result<String>;
}

/// The SSOT read from a file on every plan.
#[derive(Debug, Clone)]
pub struct SsotFile {
    path: PathBuf,
}

impl SsotFile {
    /// Creates a file source.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SsotSource for SsotFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read(&self) -> Result<String> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        debug!(path = %self.path.display(), bytes = text.len(), "Loaded SSOT");
        Ok(text)
    }
}

/// The SSOT held in memory.
#[derive(Debug, Clone)]
pub struct SsotText {
    text: String,
}

impl SsotText {
    /// Creates an in-memory source.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl SsotSource for SsotText {
    fn describe(&self) -> String {
        "<inline>".to_string()
    }

    async fn read(&self) -> Result<String> {
        Ok(self.text.clone())
    }
}
