use crate::api::{ApiError, ChatBackend, HistoryRecord, Message, Role};
use crate::storage::{self, Storage, StorageError, StorageResult, TRANSCRIPT_KEY};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("History request timed out after {0:?}")]
    Timeout(Duration),
}

/// Upper bound for a single history request.
pub const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, HistoryError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HistoryError::Timeout(timeout)),
    }
}

/// Which store a loaded transcript came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrigin {
    Remote,
    Local,
}

enum WriteOp {
    Append {
        token: String,
        record: HistoryRecord,
        timeout: Duration,
    },
    Flush(oneshot::Sender<()>),
}

/// Backend chat history, keyed by the bearer token of the caller.
///
/// Writes go through a single background task so records reach the server
/// in the order they were saved, without the caller waiting on the network.
pub struct RemoteHistory {
    backend: Arc<dyn ChatBackend>,
    storage: Arc<dyn Storage>,
    writer: mpsc::UnboundedSender<WriteOp>,
    timeout: Duration,
}

impl RemoteHistory {
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<dyn ChatBackend>, storage: Arc<dyn Storage>) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(backend.clone(), rx));
        Self {
            backend,
            storage,
            writer,
            timeout: DEFAULT_HISTORY_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn token(&self) -> Option<String> {
        storage::access_token(self.storage.as_ref())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub async fn load(&self) -> Result<Vec<Message>, HistoryError> {
        let token = self.token().ok_or(HistoryError::Unauthenticated)?;
        bounded(self.timeout, self.backend.fetch_history(&token)).await
    }

    /// Queue a record; failures are logged by the writer, never returned.
    pub fn enqueue(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let token = self.token().ok_or(HistoryError::Unauthenticated)?;
        let op = WriteOp::Append {
            token,
            record,
            timeout: self.timeout,
        };
        if self.writer.send(op).is_err() {
            warn!("history writer stopped, dropping remote history record");
        }
        Ok(())
    }

    /// Wait until every record queued so far has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriteOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn clear(&self) -> Result<(), HistoryError> {
        let token = self.token().ok_or(HistoryError::Unauthenticated)?;
        self.flush().await;
        bounded(self.timeout, self.backend.clear_history(&token)).await
    }
}

async fn run_writer(backend: Arc<dyn ChatBackend>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Append {
                token,
                record,
                timeout,
            } => {
                match bounded(timeout, backend.append_history(&token, &record)).await {
                    Ok(()) => debug!(role = %record.role, "saved remote history record"),
                    Err(e) => warn!(role = %record.role, error = %e, "failed to save chat history"),
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Transcript backup kept as one JSON array in durable local storage.
pub struct LocalHistory {
    storage: Arc<dyn Storage>,
}

impl LocalHistory {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn load(&self) -> StorageResult<Vec<Message>> {
        match self.storage.get(TRANSCRIPT_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// An unreadable blob is replaced by a fresh transcript starting at
    /// `message`.
    pub fn append(&self, message: Message) -> StorageResult<()> {
        let mut messages = match self.load() {
            Ok(messages) => messages,
            Err(StorageError::Serde(e)) => {
                error!(error = %e, "local transcript unreadable, starting a new one");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        messages.push(message);
        self.replace(&messages)
    }

    pub fn replace(&self, messages: &[Message]) -> StorageResult<()> {
        let json = serde_json::to_string(messages)?;
        self.storage.set(TRANSCRIPT_KEY, &json)
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.storage.remove(TRANSCRIPT_KEY)
    }
}

/// A place chat history can be read from and written to.
pub enum HistorySource {
    Remote(RemoteHistory),
    Local(LocalHistory),
}

impl HistorySource {
    pub fn name(&self) -> &'static str {
        match self {
            HistorySource::Remote(_) => "remote",
            HistorySource::Local(_) => "local",
        }
    }

    pub fn origin(&self) -> HistoryOrigin {
        match self {
            HistorySource::Remote(_) => HistoryOrigin::Remote,
            HistorySource::Local(_) => HistoryOrigin::Local,
        }
    }

    /// Local storage is always usable; remote only with a bearer token.
    pub fn is_available(&self) -> bool {
        match self {
            HistorySource::Remote(remote) => remote.is_authenticated(),
            HistorySource::Local(_) => true,
        }
    }

    pub async fn load(&self) -> Result<Vec<Message>, HistoryError> {
        match self {
            HistorySource::Remote(remote) => remote.load().await,
            HistorySource::Local(local) => Ok(local.load()?),
        }
    }

    /// Remote saves are queued; local saves are written before returning.
    pub fn save(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        match self {
            HistorySource::Remote(remote) => remote.enqueue(record),
            HistorySource::Local(local) => Ok(local.append(Message {
                role: record.role,
                content: record.content,
            })?),
        }
    }

    pub async fn clear(&self) -> Result<(), HistoryError> {
        match self {
            HistorySource::Remote(remote) => remote.clear().await,
            HistorySource::Local(local) => Ok(local.clear()?),
        }
    }

    pub async fn flush(&self) {
        if let HistorySource::Remote(remote) = self {
            remote.flush().await;
        }
    }
}

/// Routes finalized messages to the history sources that apply right now.
///
/// | authenticated | remote | local |
/// |---------------|--------|-------|
/// | yes           | queued | yes   |
/// | no            | no     | yes   |
pub struct PersistenceReconciler {
    /// In load preference order.
    sources: Vec<HistorySource>,
    session_id: String,
    document_filter: Mutex<Option<i64>>,
}

impl PersistenceReconciler {
    pub fn new(backend: Arc<dyn ChatBackend>, storage: Arc<dyn Storage>, session_id: String) -> Self {
        Self {
            sources: vec![
                HistorySource::Remote(RemoteHistory::new(backend, storage.clone())),
                HistorySource::Local(LocalHistory::new(storage)),
            ],
            session_id,
            document_filter: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Bound every remote history request (load, append, delete).
    pub fn set_remote_timeout(&mut self, timeout: Duration) {
        for source in &mut self.sources {
            if let HistorySource::Remote(remote) = source {
                remote.set_timeout(timeout);
            }
        }
    }

    pub fn document_filter(&self) -> Option<i64> {
        *self
            .document_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_document_filter(&self, document_id: Option<i64>) {
        *self
            .document_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = document_id;
    }

    pub fn is_authenticated(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s, HistorySource::Remote(_)) && s.is_available())
    }

    fn record(&self, role: Role, content: &str) -> HistoryRecord {
        HistoryRecord {
            role,
            content: content.to_string(),
            session_id: self.session_id.clone(),
            document_filter_id: self.document_filter(),
        }
    }

    /// Persist one finalized message. Never fails; remote problems are
    /// logged by the writer, local problems are logged here.
    pub fn save(&self, role: Role, content: &str) {
        let authenticated = self.is_authenticated();
        for source in self.sources.iter().filter(|s| s.is_available()) {
            if let Err(e) = source.save(self.record(role, content)) {
                self.log_save_failure(source, authenticated, &e);
            }
        }
    }

    /// Persist to local storage only.
    pub fn save_local(&self, role: Role, content: &str) {
        let authenticated = self.is_authenticated();
        for source in self
            .sources
            .iter()
            .filter(|s| matches!(s, HistorySource::Local(_)))
        {
            if let Err(e) = source.save(self.record(role, content)) {
                self.log_save_failure(source, authenticated, &e);
            }
        }
    }

    fn log_save_failure(&self, source: &HistorySource, authenticated: bool, e: &HistoryError) {
        match source {
            HistorySource::Local(_) if !authenticated => error!(
                error = %e,
                "local transcript write failed; anonymous session has no other copy"
            ),
            _ => warn!(source = source.name(), error = %e, "failed to save chat history"),
        }
    }

    /// Load from the first available source that answers, preferring remote.
    /// Stores are never merged.
    pub async fn load(&self) -> (Vec<Message>, HistoryOrigin) {
        for source in self.sources.iter().filter(|s| s.is_available()) {
            match source.load().await {
                Ok(messages) => {
                    info!(source = source.name(), count = messages.len(), "loaded chat history");
                    return (messages, source.origin());
                }
                Err(e) => warn!(source = source.name(), error = %e, "failed to load chat history"),
            }
        }
        (Vec::new(), HistoryOrigin::Local)
    }

    /// Clear local storage, then the remote history when signed in.
    /// Remote failures and timeouts are logged and ignored.
    pub async fn clear_all(&self) {
        let (local, remote): (Vec<_>, Vec<_>) = self
            .sources
            .iter()
            .partition(|s| matches!(s, HistorySource::Local(_)));
        for source in local {
            if let Err(e) = source.clear().await {
                error!(error = %e, "failed to clear local chat history");
            }
        }
        for source in remote.into_iter().filter(|s| s.is_available()) {
            if let Err(e) = source.clear().await {
                warn!(source = source.name(), error = %e, "failed to clear chat history");
            }
        }
    }

    /// Wait for queued remote writes to be attempted.
    pub async fn flush(&self) {
        for source in &self.sources {
            source.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, ACCESS_TOKEN_KEY};
    use crate::testing::{Call, FakeBackend};

    fn setup(authenticated: bool) -> (Arc<FakeBackend>, Arc<MemoryStorage>, PersistenceReconciler) {
        let backend = Arc::new(FakeBackend::new());
        let storage = Arc::new(MemoryStorage::new());
        if authenticated {
            storage.set(ACCESS_TOKEN_KEY, "token-1").unwrap();
        }
        let reconciler =
            PersistenceReconciler::new(backend.clone(), storage.clone(), "session-1".into());
        (backend, storage, reconciler)
    }

    #[tokio::test]
    async fn test_anonymous_save_is_local_only() {
        let (backend, storage, reconciler) = setup(false);
        reconciler.save(Role::User, "Hello");
        reconciler.flush().await;

        let local = LocalHistory::new(storage).load().unwrap();
        assert_eq!(local, vec![Message::user("Hello")]);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_save_writes_both_in_order() {
        let (backend, storage, reconciler) = setup(true);
        reconciler.set_document_filter(Some(7));
        reconciler.save(Role::User, "Q");
        reconciler.save(Role::Assistant, "A");
        reconciler.flush().await;

        let local = LocalHistory::new(storage).load().unwrap();
        assert_eq!(local, vec![Message::user("Q"), Message::assistant("A")]);

        let records = backend.appended();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[1].content, "A");
        assert!(records.iter().all(|r| r.session_id == "session-1"));
        assert!(records.iter().all(|r| r.document_filter_id == Some(7)));
    }

    #[tokio::test]
    async fn test_remote_failure_does_not_affect_local() {
        let (backend, storage, reconciler) = setup(true);
        backend.fail_append(true);
        reconciler.save(Role::User, "Q");
        reconciler.flush().await;

        assert_eq!(
            LocalHistory::new(storage).load().unwrap(),
            vec![Message::user("Q")]
        );
        assert_eq!(backend.count(|c| matches!(c, Call::AppendHistory(_))), 1);
    }

    #[tokio::test]
    async fn test_round_trip_through_remote() {
        let (_backend, _storage, reconciler) = setup(true);
        reconciler.save(Role::User, "one");
        reconciler.save(Role::Assistant, "two");
        reconciler.flush().await;

        let (messages, origin) = reconciler.load().await;
        assert_eq!(origin, HistoryOrigin::Remote);
        assert_eq!(messages, vec![Message::user("one"), Message::assistant("two")]);
    }

    #[tokio::test]
    async fn test_remote_fetch_failure_falls_back_to_local() {
        let (backend, storage, reconciler) = setup(true);
        LocalHistory::new(storage)
            .replace(&[Message::user("cached"), Message::assistant("answer")])
            .unwrap();
        backend.fail_fetch(true);

        let (messages, origin) = reconciler.load().await;
        assert_eq!(origin, HistoryOrigin::Local);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "cached");
    }

    #[tokio::test]
    async fn test_anonymous_load_never_calls_remote() {
        let (backend, _storage, reconciler) = setup(false);
        let (messages, origin) = reconciler.load().await;
        assert!(messages.is_empty());
        assert_eq!(origin, HistoryOrigin::Local);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_flushes_before_remote_delete() {
        let (backend, storage, reconciler) = setup(true);
        reconciler.save(Role::User, "Q");
        reconciler.clear_all().await;

        assert!(storage.get(TRANSCRIPT_KEY).unwrap().is_none());
        let calls = backend.calls();
        assert!(matches!(calls.as_slice(), [Call::AppendHistory(_), Call::ClearHistory]));
    }

    #[tokio::test]
    async fn test_clear_all_ignores_remote_failure() {
        let (backend, storage, reconciler) = setup(true);
        LocalHistory::new(storage.clone())
            .append(Message::user("x"))
            .unwrap();
        backend.fail_clear(true);

        reconciler.clear_all().await;
        assert!(storage.get(TRANSCRIPT_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_clears_local_when_remote_delete_hangs() {
        let (backend, storage, mut reconciler) = setup(true);
        reconciler.set_remote_timeout(Duration::from_millis(50));
        backend.stall_clear(true);
        reconciler.save(Role::User, "secret");

        tokio::time::timeout(Duration::from_secs(5), reconciler.clear_all())
            .await
            .expect("clear_all did not finish");
        assert!(storage.get(TRANSCRIPT_KEY).unwrap().is_none());
        assert_eq!(backend.count(|c| matches!(c, Call::ClearHistory)), 1);
    }

    #[tokio::test]
    async fn test_local_cleared_before_remote_delete_starts() {
        let (backend, storage, mut reconciler) = setup(true);
        reconciler.set_remote_timeout(Duration::from_secs(5));
        backend.stall_clear(true);
        reconciler.save(Role::User, "secret");
        reconciler.flush().await;

        let clearing = reconciler.clear_all();
        tokio::pin!(clearing);
        while backend.count(|c| matches!(c, Call::ClearHistory)) == 0 {
            tokio::select! {
                _ = &mut clearing => panic!("remote delete should still be pending"),
                _ = tokio::task::yield_now() => {}
            }
        }
        assert!(storage.get(TRANSCRIPT_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hung_history_fetch_falls_back_to_local() {
        let (backend, storage, mut reconciler) = setup(true);
        reconciler.set_remote_timeout(Duration::from_millis(50));
        LocalHistory::new(storage).replace(&[Message::user("cached")]).unwrap();
        backend.stall_fetch(true);

        let (messages, origin) = reconciler.load().await;
        assert_eq!(origin, HistoryOrigin::Local);
        assert_eq!(messages, vec![Message::user("cached")]);
    }

    #[tokio::test]
    async fn test_saves_after_corrupt_blob_start_fresh() {
        let (_backend, storage, reconciler) = setup(false);
        storage.set(TRANSCRIPT_KEY, "{truncated").unwrap();
        reconciler.save(Role::User, "Hello");
        reconciler.save(Role::Assistant, "Hi there!");

        let (messages, origin) = reconciler.load().await;
        assert_eq!(origin, HistoryOrigin::Local);
        assert_eq!(
            messages,
            vec![Message::user("Hello"), Message::assistant("Hi there!")]
        );
    }

    #[tokio::test]
    async fn test_corrupt_local_blob_loads_empty() {
        let (_backend, storage, reconciler) = setup(false);
        storage.set(TRANSCRIPT_KEY, "not json").unwrap();
        let (messages, origin) = reconciler.load().await;
        assert!(messages.is_empty());
        assert_eq!(origin, HistoryOrigin::Local);
    }
}
