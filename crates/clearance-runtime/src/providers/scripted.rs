//! In-process provider that replays prepared chunks.
//!
//! Used for offline replay of recorded transcripts and for tests. It can
//! simulate slow streams, truncation, mid-stream failures and transient
//! failures while opening.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{ChatMessage, ChunkStream, CompletionConfig, ModelChunk, ModelProvider, ProviderError};

/// Provider returning scripted output.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    chunks: Vec<String>,
    omit_end: bool,
    hang_at_end: bool,
    chunk_delay: Option<Duration>,
    error_after: Option<usize>,
    failing_opens: AtomicU32,
    open_attempts: AtomicU32,
    completions: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    /// Stream the given chunks, then the end marker.
    pub fn new(chunks: Vec<String>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    /// Split a recorded transcript into chunks of `chunk_chars` characters.
    pub fn from_transcript(transcript: &str, chunk_chars: usize) -> Self {
        let size = chunk_chars.max(1);
        let chars: Vec<char> = transcript.chars().collect();
        let chunks = chars
            .chunks(size)
            .map(|c| c.iter().collect::<String>())
            .collect();
        Self::new(chunks)
    }

    /// End the stream without the end marker.
    pub fn without_end(mut self) -> Self {
        self.omit_end = true;
        self
    }

    /// Never finish after the last chunk.
    pub fn hang_at_end(mut self) -> Self {
        self.hang_at_end = true;
        self
    }

    /// Sleep before yielding each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Fail the stream after `chunks` chunks.
    pub fn error_after(mut self, chunks: usize) -> Self {
        self.error_after = Some(chunks);
        self
    }

    /// Fail the first `count` opens with a transient error.
    pub fn failing_opens(self, count: u32) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    /// Queue the text returned by the next `complete` call.
    pub fn with_completion(self, text: impl Into<String>) -> Self {
        self.completions.lock().push_back(Ok(text.into()));
        self
    }

    /// Queue an error for the next `complete` call.
    pub fn with_completion_error(self, error: ProviderError) -> Self {
        self.completions.lock().push_back(Err(error));
        self
    }

    /// Number of `open_stream` calls so far.
    pub fn open_attempts(&self) -> u32 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Every prompt received, in call order.
    pub fn recorded_prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().clone()
    }

    fn script(&self) -> Vec<Result<ModelChunk, ProviderError>> {
        let mut items = Vec::new();
        for (index, chunk) in self.chunks.iter().enumerate() {
            if self.error_after == Some(index) {
                items.push(Err(ProviderError::StreamError(
                    "scripted connection reset".to_string(),
                )));
                return items;
            }
            items.push(Ok(ModelChunk::Text(chunk.clone())));
        }
        if self.error_after.is_some_and(|n| n >= self.chunks.len()) {
            items.push(Err(ProviderError::StreamError(
                "scripted connection reset".to_string(),
            )));
            return items;
        }
        if !self.omit_end && !self.hang_at_end {
            items.push(Ok(ModelChunk::End));
        }
        items
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<ChunkStream, ProviderError> {
        self.prompts.lock().push(messages);
        self.open_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::HttpError(
                "scripted transient failure".to_string(),
            ));
        }

        let delay = self.chunk_delay;
        let items = stream::iter(self.script()).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });

        if self.hang_at_end {
            Ok(items.chain(stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().push(messages);
        self.completions.lock().pop_front().unwrap_or_else(|| {
            Err(ProviderError::NotConfigured(
                "no scripted completion left".to_string(),
            ))
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
