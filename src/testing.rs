//! Scripted in-memory `ChatBackend` used by unit tests.

use crate::api::{ApiError, ByteStream, ChatBackend, ChatQuery, HistoryRecord, Message};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Call {
    Chat(ChatQuery),
    FetchHistory,
    AppendHistory(HistoryRecord),
    ClearHistory,
}

#[derive(Debug, Clone)]
pub enum Piece {
    Data(Vec<u8>),
    Fail(String),
}

/// What the chat endpoint does for the next query.
#[derive(Debug, Clone)]
pub enum Reply {
    Stream(Vec<Piece>),
    /// Deliver the pieces, then never finish.
    Stall(Vec<Piece>),
    Status(u16),
}

impl Reply {
    pub fn text(chunks: &[&str]) -> Self {
        Reply::Stream(
            chunks
                .iter()
                .map(|c| Piece::Data(c.as_bytes().to_vec()))
                .collect(),
        )
    }
}

#[derive(Default)]
pub struct FakeBackend {
    replies: Mutex<VecDeque<Reply>>,
    history: Mutex<Vec<Message>>,
    calls: Mutex<Vec<Call>>,
    fail_fetch: AtomicBool,
    fail_append: AtomicBool,
    fail_clear: AtomicBool,
    stall_fetch: AtomicBool,
    stall_clear: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::SeqCst);
    }

    /// Make history fetches never answer.
    pub fn stall_fetch(&self, stall: bool) {
        self.stall_fetch.store(stall, Ordering::SeqCst);
    }

    /// Make history deletes never answer.
    pub fn stall_clear(&self, stall: bool) {
        self.stall_clear.store(stall, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(*c)).count()
    }

    pub fn appended(&self) -> Vec<HistoryRecord> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AppendHistory(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn server_error() -> ApiError {
        ApiError::Api {
            status: 500,
            message: "Internal Server Error".into(),
        }
    }
}

fn pieces(pieces: Vec<Piece>) -> impl futures::Stream<Item = Result<Bytes, ApiError>> {
    stream::iter(pieces.into_iter().map(|p| match p {
        Piece::Data(data) => Ok(Bytes::from(data)),
        Piece::Fail(message) => Err(ApiError::Parse(message)),
    }))
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn open_chat_stream(&self, query: &ChatQuery) -> Result<ByteStream, ApiError> {
        self.record(Call::Chat(query.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Stream(Vec::new()));
        match reply {
            Reply::Stream(p) => Ok(pieces(p).boxed()),
            Reply::Stall(p) => Ok(pieces(p).chain(stream::pending()).boxed()),
            Reply::Status(status) => Err(ApiError::Api {
                status,
                message: "scripted failure".into(),
            }),
        }
    }

    async fn fetch_history(&self, _token: &str) -> Result<Vec<Message>, ApiError> {
        self.record(Call::FetchHistory);
        if self.stall_fetch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }
        Ok(self.history.lock().unwrap().clone())
    }

    async fn append_history(&self, _token: &str, record: &HistoryRecord) -> Result<(), ApiError> {
        self.record(Call::AppendHistory(record.clone()));
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }
        self.history.lock().unwrap().push(Message {
            role: record.role,
            content: record.content.clone(),
        });
        Ok(())
    }

    async fn clear_history(&self, _token: &str) -> Result<(), ApiError> {
        self.record(Call::ClearHistory);
        if self.stall_clear.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_clear.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }
        self.history.lock().unwrap().clear();
        Ok(())
    }
}
