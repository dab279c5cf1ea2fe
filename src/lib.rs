pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod history;
pub mod session;
pub mod storage;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ChatBackend, Message, Role};
pub use history::{HistoryOrigin, HistorySource, PersistenceReconciler};
pub use session::{ChatEvent, ChatSession, SendOutcome, SessionState};
pub use storage::{MemoryStorage, Storage};
pub use stream::{StreamDecoder, Utf8Decoder};
