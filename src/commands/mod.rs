pub mod auth;
pub mod chat;
pub mod documents;
pub mod settings;

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::db::Database;
use crate::session::ChatSession;
use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a command needs: durable storage, effective config and the
/// HTTP client built from it.
pub struct Context {
    pub db: Arc<Database>,
    pub config: ClientConfig,
    pub client: ApiClient,
}

impl Context {
    /// Open the database at `db_path` and apply one-run overrides on top of
    /// the stored settings.
    pub fn open(db_path: &Path, api_base: Option<String>) -> Result<Self> {
        let db = Arc::new(
            Database::open(db_path)
                .with_context(|| format!("opening database {}", db_path.display()))?,
        );
        let mut config = ClientConfig::load(db.as_ref()).context("loading settings")?;
        if let Some(api_base) = api_base {
            config.api_base = api_base;
        }
        let client = ApiClient::new(&config.api_base, config.connect_timeout)
            .context("building HTTP client")?;
        Ok(Self { db, config, client })
    }

    pub fn chat_session(&self) -> Result<ChatSession> {
        let session = ChatSession::new(Arc::new(self.client.clone()), self.db.clone())
            .context("creating chat session")?
            .with_chunk_timeout(self.config.chunk_timeout)
            .with_history_timeout(self.config.history_timeout);
        session.set_document_filter(self.config.document_id);
        Ok(session)
    }
}

/// `<data dir>/docchat/docchat.db`, or the working directory when the
/// platform has no data dir.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docchat")
        .join("docchat.db")
}
