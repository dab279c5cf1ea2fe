use crate::api::{ApiError, ByteStream};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(#[from] ApiError),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("No data received for {0:?}")]
    Timeout(Duration),
}

/// How a stream that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

/// Stateful UTF-8 decoder that carries incomplete trailing sequences over
/// to the next chunk, so a character is never split between two outputs.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode everything that forms complete characters. The returned text
    /// may be empty when the chunk only extends a pending sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, StreamError> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_some() => {
                return Err(StreamError::Decode(format!(
                    "invalid UTF-8 sequence at byte {}",
                    e.valid_up_to()
                )));
            }
            Err(e) => e.valid_up_to(),
        };
        let rest = self.pending.split_off(valid);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8(complete).map_err(|e| StreamError::Decode(e.to_string()))
    }

    /// Signal end of input; leftover bytes mean the body was truncated
    /// inside a character.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            let len = self.pending.len();
            self.pending.clear();
            Err(StreamError::Decode(format!(
                "stream ended inside a character ({} dangling bytes)",
                len
            )))
        }
    }
}

/// Pulls a chunked body one chunk at a time and hands decoded text to a
/// consumer before pulling the next chunk.
pub struct StreamDecoder {
    decoder: Utf8Decoder,
    cancel: CancellationToken,
    chunk_timeout: Option<Duration>,
}

impl StreamDecoder {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            cancel,
            chunk_timeout: None,
        }
    }

    /// Fail the stream when no chunk arrives within `timeout`.
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Drive `stream` to its end. Text already handed to `on_text` stays
    /// delivered even when an error is returned afterwards.
    pub async fn run<F>(
        mut self,
        mut stream: ByteStream,
        mut on_text: F,
    ) -> Result<StreamEnd, StreamError>
    where
        F: FnMut(&str),
    {
        let mut chunks = 0usize;
        let mut bytes = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(chunks, bytes, "stream cancelled");
                    return Ok(StreamEnd::Cancelled);
                }
                next = Self::pull(&mut stream, self.chunk_timeout) => next?,
            };

            match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    bytes += chunk.len();
                    let text = self.decoder.decode(&chunk)?;
                    if !text.is_empty() {
                        on_text(&text);
                    }
                }
                Some(Err(e)) => return Err(StreamError::Transport(e)),
                None => {
                    self.decoder.finish()?;
                    debug!(chunks, bytes, "stream completed");
                    return Ok(StreamEnd::Completed);
                }
            }
        }
    }

    async fn pull(
        stream: &mut ByteStream,
        timeout: Option<Duration>,
    ) -> Result<Option<Result<bytes::Bytes, ApiError>>, StreamError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| StreamError::Timeout(limit)),
            None => Ok(stream.next().await),
        }
    }
}
