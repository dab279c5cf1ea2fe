use crate::api::{ChatBackend, ChatQuery, Message, Role};
use crate::history::{HistoryOrigin, PersistenceReconciler};
use crate::storage::{self, Storage, StorageResult};
use crate::stream::{StreamDecoder, StreamEnd, StreamError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shown in place of the answer when an exchange fails.
pub const ERROR_MESSAGE: &str = "Sorry, an error occurred. Please try again.";

/// Shown when an exchange was cancelled before any text arrived.
pub const CANCELLED_MESSAGE: &str = "Response cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Request issued, waiting for the response head.
    Sending,
    Streaming,
    /// Exchange failed; the error message is being put in place.
    Error,
    /// Loading or clearing history.
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Failed,
    Cancelled,
    /// Empty query, or another operation was still running.
    Rejected,
}

/// Progress notifications for whoever renders the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Delta(String),
    Completed(String),
    Failed { partial: String, error: String },
    Cancelled(String),
}

struct Transcript {
    messages: Vec<Message>,
    state: SessionState,
    in_flight: Option<CancellationToken>,
}

/// One chat transcript plus the machinery to extend, persist and restore it.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    persistence: PersistenceReconciler,
    chunk_timeout: Option<Duration>,
    inner: Mutex<Transcript>,
    shutdown: CancellationToken,
}

impl ChatSession {
    /// Must be called from within a tokio runtime. Creates the session id
    /// in `storage` if there is none yet.
    pub fn new(backend: Arc<dyn ChatBackend>, storage: Arc<dyn Storage>) -> StorageResult<Self> {
        let session_id = storage::session_id(storage.as_ref())?;
        debug!(%session_id, "chat session ready");
        Ok(Self {
            persistence: PersistenceReconciler::new(backend.clone(), storage, session_id),
            backend,
            chunk_timeout: None,
            inner: Mutex::new(Transcript {
                messages: Vec::new(),
                state: SessionState::Idle,
                in_flight: None,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Bound each remote history request so a silent backend cannot hold
    /// `clear` or `load_history` forever.
    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.persistence.set_remote_timeout(timeout);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Transcript> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        self.persistence.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.persistence.is_authenticated()
    }

    pub fn document_filter(&self) -> Option<i64> {
        self.persistence.document_filter()
    }

    /// Restrict answers (and recorded history) to one document, or `None`
    /// for all documents.
    pub fn set_document_filter(&self, document_id: Option<i64>) {
        self.persistence.set_document_filter(document_id);
    }

    pub async fn send(&self, query: &str) -> SendOutcome {
        self.send_with(query, |_| {}).await
    }

    /// Run one question/answer exchange. Never fails: errors end up as the
    /// fixed error message in the transcript.
    pub async fn send_with<F>(&self, query: &str, mut on_event: F) -> SendOutcome
    where
        F: FnMut(ChatEvent) + Send,
    {
        if query.trim().is_empty() {
            return SendOutcome::Rejected;
        }

        let cancel = {
            let mut inner = self.lock();
            if inner.state != SessionState::Idle {
                debug!(state = ?inner.state, "send rejected, session busy");
                return SendOutcome::Rejected;
            }
            inner.messages.push(Message::user(query));
            inner.messages.push(Message::assistant(""));
            inner.state = SessionState::Sending;
            let cancel = self.shutdown.child_token();
            inner.in_flight = Some(cancel.clone());
            cancel
        };

        let request = ChatQuery {
            query: query.to_string(),
            document_id: self.persistence.document_filter(),
        };
        info!(document_id = ?request.document_id, "sending chat query");

        let result = self.exchange(&request, cancel, &mut on_event).await;
        let content = self.last_content();

        match result {
            Ok(StreamEnd::Completed) => {
                self.finalize(query, &content);
                on_event(ChatEvent::Completed(content));
                SendOutcome::Completed
            }
            Ok(StreamEnd::Cancelled) => {
                info!("chat response cancelled");
                let content = if content.is_empty() {
                    CANCELLED_MESSAGE.to_string()
                } else {
                    content
                };
                self.finish_unsuccessful(query, SessionState::Idle, &content);
                on_event(ChatEvent::Cancelled(content));
                SendOutcome::Cancelled
            }
            Err(e) => {
                error!(error = %e, "chat error");
                self.finish_unsuccessful(query, SessionState::Error, ERROR_MESSAGE);
                on_event(ChatEvent::Failed {
                    partial: content,
                    error: e.to_string(),
                });
                SendOutcome::Failed
            }
        }
    }

    async fn exchange<F>(
        &self,
        request: &ChatQuery,
        cancel: CancellationToken,
        on_event: &mut F,
    ) -> Result<StreamEnd, StreamError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.backend.open_chat_stream(request) => opened?,
        };
        self.set_state(SessionState::Streaming);

        StreamDecoder::new(cancel)
            .with_chunk_timeout(self.chunk_timeout)
            .run(stream, |text| {
                self.on_chunk(text);
                on_event(ChatEvent::Delta(text.to_string()));
            })
            .await
    }

    /// Append decoded text to the assistant message being streamed.
    pub fn on_chunk(&self, text: &str) {
        let mut inner = self.lock();
        if inner.state != SessionState::Streaming {
            warn!("chunk arrived outside of a streaming exchange, dropped");
            return;
        }
        if let Some(last) = inner.messages.last_mut() {
            if last.role == Role::Assistant {
                last.content.push_str(text);
            }
        }
    }

    fn last_content(&self) -> String {
        self.lock()
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Freeze the streamed answer and persist the exchange.
    fn finalize(&self, query: &str, content: &str) {
        {
            let mut inner = self.lock();
            inner.state = SessionState::Idle;
            inner.in_flight = None;
        }
        self.persistence.save(Role::User, query);
        self.persistence.save(Role::Assistant, content);
    }

    /// Replace the answer with `content`, keep the exchange in local storage
    /// only, and return to idle.
    fn finish_unsuccessful(&self, query: &str, state: SessionState, content: &str) {
        {
            let mut inner = self.lock();
            inner.state = state;
            if let Some(last) = inner.messages.last_mut() {
                last.content = content.to_string();
            }
        }
        self.persistence.save_local(Role::User, query);
        self.persistence.save_local(Role::Assistant, content);
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        inner.in_flight = None;
    }

    /// Cancel the exchange in flight, if any.
    pub fn cancel(&self) -> bool {
        match &self.lock().in_flight {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the current exchange and every future one.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Try to move from idle to `Syncing`.
    fn begin_sync(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            return false;
        }
        inner.state = SessionState::Syncing;
        true
    }

    /// Empty the transcript and purge stored history. Rejected while an
    /// exchange is running.
    pub async fn clear(&self) -> bool {
        if !self.begin_sync() {
            debug!("clear rejected, session busy");
            return false;
        }
        self.lock().messages.clear();
        self.persistence.clear_all().await;
        self.set_state(SessionState::Idle);
        info!("chat history cleared");
        true
    }

    /// Replace the transcript with stored history: remote when signed in,
    /// local otherwise or when the remote fetch fails.
    pub async fn load_history(&self) -> Option<HistoryOrigin> {
        if !self.begin_sync() {
            debug!("history load rejected, session busy");
            return None;
        }
        let (messages, origin) = self.persistence.load().await;
        let mut inner = self.lock();
        inner.messages = messages;
        inner.state = SessionState::Idle;
        Some(origin)
    }

    /// Wait for queued remote history writes.
    pub async fn flush(&self) {
        self.persistence.flush().await;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
