//! Streaming result handed to callers of `route_stream`.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::{CachedResponse, Fingerprint, ResponseCache};
use crate::ledger::{Ledger, LedgerRecord};
use crate::provider::{estimate_tokens, ChunkStream, ProviderError, StreamChunk, TokenUsage};
use crate::registry::ModelDescriptor;

use super::FallbackEvent;

/// Where a finished stream should be cached.
pub(crate) struct CacheSlot {
    pub cache: Arc<ResponseCache>,
    pub key: Fingerprint,
    pub ttl: Duration,
}

/// A routed, cancellable chunk stream.
///
/// Model selection and fallback are already settled when this is returned;
/// failures from here on are yielded as `Err` items and end the stream.
/// Exactly one ledger record is written per stream: when it ends, fails, or
/// is dropped early. A dropped stream releases its provider connection and
/// records the tokens produced so far.
pub struct RoutedStream {
    inner: Option<ChunkStream>,
    buffered: Option<StreamChunk>,
    model: Arc<ModelDescriptor>,
    fallback_events: Vec<FallbackEvent>,
    cache_hit: bool,
    budget_exceeded: bool,
    text: String,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    estimated_input_tokens: u32,
    ledger: Arc<Ledger>,
    cache_slot: Option<CacheSlot>,
    started: Instant,
    recorded: bool,
}

impl RoutedStream {
    /// Stream over a live provider connection. `first` is the chunk already
    /// pulled while deciding whether to fall back.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn live(
        inner: ChunkStream,
        first: Option<StreamChunk>,
        model: Arc<ModelDescriptor>,
        fallback_events: Vec<FallbackEvent>,
        budget_exceeded: bool,
        estimated_input_tokens: u32,
        ledger: Arc<Ledger>,
        cache_slot: Option<CacheSlot>,
        started: Instant,
    ) -> Self {
        Self {
            inner: Some(inner),
            buffered: first,
            model,
            fallback_events,
            cache_hit: false,
            budget_exceeded,
            text: String::new(),
            usage: None,
            finish_reason: None,
            estimated_input_tokens,
            ledger,
            cache_slot,
            started,
            recorded: false,
        }
    }

    /// One-chunk stream replaying a cached answer. The ledger record is
    /// written by the router before this is built.
    pub(crate) fn cached(
        cached: CachedResponse,
        model: Arc<ModelDescriptor>,
        budget_exceeded: bool,
        ledger: Arc<Ledger>,
        started: Instant,
    ) -> Self {
        let usage = TokenUsage {
            input_tokens: cached.input_tokens,
            output_tokens: cached.output_tokens,
        };
        let chunk = StreamChunk {
            text: cached.text,
            usage: Some(usage),
            finish_reason: cached.finish_reason,
        };
        Self {
            inner: None,
            buffered: Some(chunk),
            model,
            fallback_events: Vec::new(),
            cache_hit: true,
            budget_exceeded,
            text: String::new(),
            usage: Some(usage),
            finish_reason: None,
            estimated_input_tokens: 0,
            ledger,
            cache_slot: None,
            started,
            recorded: true,
        }
    }

    pub fn model_used(&self) -> &str {
        &self.model.id
    }

    pub fn provider(&self) -> &str {
        &self.model.provider
    }

    pub fn cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub fn fallback_events(&self) -> &[FallbackEvent] {
        &self.fallback_events
    }

    pub fn budget_exceeded(&self) -> bool {
        self.budget_exceeded
    }

    /// Text yielded so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Token counts so far: reported usage if the provider sent it,
    /// otherwise an estimate from the text produced.
    pub fn usage(&self) -> TokenUsage {
        self.usage.unwrap_or(TokenUsage {
            input_tokens: self.estimated_input_tokens,
            output_tokens: estimate_tokens(&self.text),
        })
    }

    /// Cost of the tokens so far; zero for cache hits.
    pub fn cost_usd(&self) -> f64 {
        if self.cache_hit {
            return 0.0;
        }
        let usage = self.usage();
        self.model.cost_usd(usage.input_tokens, usage.output_tokens)
    }

    fn absorb(&mut self, chunk: &StreamChunk) {
        self.text.push_str(&chunk.text);
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason.clone_from(&chunk.finish_reason);
        }
    }

    /// Write the single ledger record for this stream. `complete` streams
    /// are also cached.
    fn finish(&mut self, complete: bool) {
        self.inner = None;
        if self.recorded {
            return;
        }
        self.recorded = true;

        let usage = self.usage();
        let cost = self.cost_usd();
        self.ledger.record(
            LedgerRecord::call(
                &self.model.provider,
                &self.model.id,
                usage.input_tokens,
                usage.output_tokens,
                cost,
                !self.fallback_events.is_empty(),
            )
            .streamed(),
        );

        if complete {
            if let Some(slot) = self.cache_slot.take() {
                slot.cache.put(
                    slot.key,
                    CachedResponse {
                        text: self.text.clone(),
                        model_used: self.model.id.clone(),
                        provider: self.model.provider.clone(),
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        finish_reason: self.finish_reason.clone(),
                    },
                    slot.ttl,
                );
            }
            tracing::info!(
                model = %self.model.id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cost_usd = cost,
                latency_ms = self.started.elapsed().as_millis() as u64,
                "Stream completed"
            );
        }
    }
}

impl Stream for RoutedStream {
    type Item = Result<StreamChunk, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(chunk) = this.buffered.take() {
            if !this.cache_hit {
                this.absorb(&chunk);
            } else {
                this.text.push_str(&chunk.text);
            }
            return Poll::Ready(Some(Ok(chunk)));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.absorb(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                tracing::warn!(
                    model = %this.model.id,
                    kind = %err.kind,
                    error = %err.message,
                    "Stream failed after start"
                );
                this.finish(false);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for RoutedStream {
    fn drop(&mut self) {
        if !self.recorded {
            tracing::debug!(
                model = %self.model.id,
                chars = self.text.len(),
                "Stream dropped before completion, recording partial usage"
            );
            self.finish(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TimeWindow;
    use crate::registry::Capability;
    use futures::StreamExt;

    fn model() -> Arc<ModelDescriptor> {
        Arc::new(ModelDescriptor::new(
            "m",
            "p",
            [Capability::Simple],
            1.0,
            2.0,
            8000,
        ))
    }

    fn chunks(items: Vec<Result<StreamChunk, ProviderError>>) -> ChunkStream {
        Box::pin(futures::stream::iter(items))
    }

    fn live(inner: ChunkStream, ledger: Arc<Ledger>) -> RoutedStream {
        RoutedStream::live(
            inner,
            None,
            model(),
            Vec::new(),
            false,
            10,
            ledger,
            None,
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_complete_stream_records_reported_usage() {
        let ledger = Arc::new(Ledger::new());
        let mut stream = live(
            chunks(vec![
                Ok(StreamChunk::text("Hel")),
                Ok(StreamChunk::text("lo")),
                Ok(StreamChunk {
                    usage: Some(TokenUsage {
                        input_tokens: 1000,
                        output_tokens: 500,
                    }),
                    ..StreamChunk::default()
                }),
            ]),
            Arc::clone(&ledger),
        );
        while stream.next().await.is_some() {}
        assert_eq!(stream.text(), "Hello");

        let records = ledger.records(&TimeWindow::all());
        assert_eq!(records.len(), 1);
        assert!(records[0].streaming);
        assert_eq!(records[0].input_tokens, 1000);
        assert!((records[0].cost_usd - 2.0).abs() < 1e-9);

        drop(stream);
        assert_eq!(ledger.len(), 1, "drop after completion must not double-record");
    }

    #[tokio::test]
    async fn test_drop_mid_stream_records_partial_tokens() {
        let ledger = Arc::new(Ledger::new());
        let mut stream = live(
            Box::pin(
                futures::stream::iter(vec![Ok::<_, ProviderError>(StreamChunk::text(
                    "abcdefgh",
                ))])
                    .chain(futures::stream::pending()),
            ),
            Arc::clone(&ledger),
        );
        assert_eq!(stream.next().await.unwrap().unwrap().text, "abcdefgh");
        {
            let mut next = tokio_test::task::spawn(stream.next());
            tokio_test::assert_pending!(next.poll());
        }
        assert_eq!(ledger.len(), 0, "nothing recorded while the stream is live");
        drop(stream);

        let records = ledger.records(&TimeWindow::all());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_tokens, 10);
        assert_eq!(records[0].output_tokens, 2);
    }

    #[tokio::test]
    async fn test_error_after_start_ends_stream() {
        let ledger = Arc::new(Ledger::new());
        let mut stream = live(
            chunks(vec![
                Ok(StreamChunk::text("part")),
                Err(ProviderError::server("connection reset")),
                Ok(StreamChunk::text("never")),
            ]),
            Arc::clone(&ledger),
        );
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.text(), "part");
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_cached_stream_replays_without_recording() {
        let ledger = Arc::new(Ledger::new());
        let cached = CachedResponse {
            text: "cached answer".to_string(),
            model_used: "m".to_string(),
            provider: "p".to_string(),
            input_tokens: 3,
            output_tokens: 4,
            finish_reason: Some("stop".to_string()),
        };
        let stream = RoutedStream::cached(cached, model(), false, Arc::clone(&ledger), Instant::now());
        assert!(stream.cache_hit());
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().text, "cached answer");
        assert_eq!(ledger.len(), 0);
    }
}
