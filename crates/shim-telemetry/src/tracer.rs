use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tracing_setup::{generate_span_id, generate_trace_id};

// ---------------------------------------------------------------------------
// Span data
// ---------------------------------------------------------------------------

/// Identity of a live span, used to parent child spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

/// A completed span waiting to be flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedSpan {
    pub service: String,
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_us: u64,
    pub tags: BTreeMap<String, String>,
}

/// `tracing` target the log sink exports spans under.
pub const TRACE_TARGET: &str = "shim::trace";

/// Destination for flushed spans.
pub trait SpanSink: Send + Sync {
    fn export(&self, spans: Vec<FinishedSpan>);
}

/// Writes each span as one JSON line through `tracing` under [`TRACE_TARGET`].
#[derive(Debug, Default)]
pub struct LogSpanSink;

impl SpanSink for LogSpanSink {
    fn export(&self, spans: Vec<FinishedSpan>) {
        for span in spans {
            match serde_json::to_string(&span) {
                Ok(line) => info!(target: TRACE_TARGET, span = %line, "span"),
                Err(e) => warn!(error = %e, name = %span.name, "failed to encode span"),
            }
        }
    }
}

/// Keeps exported spans in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySpanSink {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
    exports: Arc<Mutex<usize>>,
}

impl MemorySpanSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of times `export` was called.
    pub fn export_count(&self) -> usize {
        *self.exports.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpanSink for MemorySpanSink {
    fn export(&self, spans: Vec<FinishedSpan>) {
        *self.exports.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(spans);
    }
}

// ---------------------------------------------------------------------------
// Span
// ---------------------------------------------------------------------------

struct ActiveSpan {
    record: FinishedSpan,
    started: Instant,
    log_span: tracing::Span,
    buffer: Arc<Mutex<Vec<FinishedSpan>>>,
}

/// Handle to an in-flight span. Finishing is idempotent and also happens on
/// drop. A no-op span carries nothing and every call on it returns
/// immediately.
pub struct Span {
    inner: Option<ActiveSpan>,
}

impl Span {
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.is_some()
    }

    pub fn context(&self) -> Option<SpanContext> {
        self.inner.as_ref().map(|a| SpanContext {
            trace_id: a.record.trace_id.clone(),
            span_id: a.record.span_id.clone(),
        })
    }

    /// Attach a key/value tag, e.g. `category=interactive`.
    pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
        if let Some(active) = self.inner.as_mut() {
            let value = value.into();
            active.log_span.record(key, value.as_str());
            active.record.tags.insert(key.to_string(), value);
        }
    }

    /// The `tracing` span mirroring this span, so log lines emitted during
    /// the phase carry its ids. Disabled spans return `Span::none()`.
    pub fn log_span(&self) -> tracing::Span {
        self.inner
            .as_ref()
            .map(|a| a.log_span.clone())
            .unwrap_or_else(tracing::Span::none)
    }

    pub fn finish(&mut self) {
        if let Some(mut active) = self.inner.take() {
            active.record.duration_us = active.started.elapsed().as_micros() as u64;
            debug!(
                name = %active.record.name,
                duration_us = active.record.duration_us,
                "span finished"
            );
            active
                .buffer
                .lock()
                .unwrap_or_else(|e| {
                    warn!("span buffer lock was poisoned, recovering");
                    e.into_inner()
                })
                .push(active.record);
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.inner.as_ref().map(|a| a.record.name.as_str()))
            .field("recording", &self.is_recording())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// Creates spans around session phases and flushes them at exit.
pub trait Tracer: Send + Sync {
    /// Start a span. With `parent` the span joins the parent's trace.
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Span;

    /// Export buffered spans. Only the first call exports anything; it
    /// returns the number of spans exported.
    fn flush(&self) -> usize;

    fn is_enabled(&self) -> bool;
}

/// Used when tracing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _parent: Option<&SpanContext>) -> Span {
        Span::noop()
    }

    fn flush(&self) -> usize {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Records spans in memory and hands them to a [`SpanSink`] on flush.
pub struct SpanTracer {
    service: String,
    buffer: Arc<Mutex<Vec<FinishedSpan>>>,
    sink: Box<dyn SpanSink>,
    flushed: AtomicBool,
}

impl SpanTracer {
    pub fn new(service: impl Into<String>, sink: Box<dyn SpanSink>) -> Self {
        Self {
            service: service.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            sink,
            flushed: AtomicBool::new(false),
        }
    }

    /// Spans finished but not yet flushed.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Tracer for SpanTracer {
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Span {
        let trace_id = parent
            .map(|p| p.trace_id.clone())
            .unwrap_or_else(generate_trace_id);
        let span_id = generate_span_id();
        let log_span = tracing::info_span!(
            "trace_span",
            op = %name,
            trace_id = %trace_id,
            span_id = %span_id,
            category = tracing::field::Empty,
        );
        Span {
            inner: Some(ActiveSpan {
                record: FinishedSpan {
                    service: self.service.clone(),
                    name: name.to_string(),
                    trace_id,
                    span_id,
                    parent_span_id: parent.map(|p| p.span_id.clone()),
                    started_at: Utc::now(),
                    duration_us: 0,
                    tags: BTreeMap::new(),
                },
                started: Instant::now(),
                log_span,
                buffer: Arc::clone(&self.buffer),
            }),
        }
    }

    fn flush(&self) -> usize {
        if self.flushed.swap(true, Ordering::SeqCst) {
            debug!("tracer already flushed");
            return 0;
        }
        let spans: Vec<FinishedSpan> = std::mem::take(
            &mut *self.buffer.lock().unwrap_or_else(|e| {
                warn!("span buffer lock was poisoned, recovering");
                e.into_inner()
            }),
        );
        let count = spans.len();
        self.sink.export(spans);
        info!(count, "trace data flushed");
        count
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for SpanTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanTracer")
            .field("service", &self.service)
            .field("pending", &self.pending())
            .field("flushed", &self.flushed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Tracer named `service`: a [`SpanTracer`] exporting to the log when
/// `enabled`, otherwise a [`NoopTracer`].
pub fn create_tracer(service: &str, enabled: bool) -> Arc<dyn Tracer> {
    if enabled {
        Arc::new(SpanTracer::new(service, Box::new(LogSpanSink)))
    } else {
        Arc::new(NoopTracer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
