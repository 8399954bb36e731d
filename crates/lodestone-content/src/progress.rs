//! Progress reporting and per-call operation context

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ContentError, Result};

/// Snapshot of a long-running operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Operation name such as "deliver" or "prepare"
    pub operation: String,
    /// Item currently being processed
    pub current_item: Option<String>,
    /// Bytes processed so far
    pub bytes_transferred: u64,
    /// Total bytes, when every size is known up front
    pub total_bytes: Option<u64>,
    /// Items finished
    pub items_completed: usize,
    /// Items in the whole operation
    pub items_total: usize,
    /// 0.0 to 100.0
    pub percentage: f64,
}

impl ProgressEvent {
    /// Build an event, deriving the percentage from bytes when a total is
    /// known and from item counts otherwise
    pub fn new(
        operation: impl Into<String>,
        current_item: Option<String>,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        items_completed: usize,
        items_total: usize,
    ) -> Self {
        let percentage = match total_bytes {
            Some(total) if total > 0 => bytes_transferred as f64 / total as f64 * 100.0,
            _ if items_total > 0 => items_completed as f64 / items_total as f64 * 100.0,
            _ => 0.0,
        };
        Self {
            operation: operation.into(),
            current_item,
            bytes_transferred,
            total_bytes,
            items_completed,
            items_total,
            percentage: percentage.clamp(0.0, 100.0),
        }
    }
}

/// Non-blocking progress sender
///
/// Events are dropped when the receiver lags; progress is advisory and must
/// never stall a transfer.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// Sink that discards every event
    pub const fn none() -> Self {
        Self { tx: None }
    }

    /// Whether a receiver is still listening
    pub fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Send without blocking; events are dropped when the receiver lags
    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                trace!(operation = %event.operation, "progress receiver lagging, event dropped");
            }
        }
    }
}

/// Bounded progress channel
pub fn progress_channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSink { tx: Some(tx) }, rx)
}

/// Per-call progress, cancellation and timeout
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Where progress events go
    pub progress: ProgressSink,
    /// Cancels the operation when fired
    pub cancel: CancellationToken,
    /// Overall limit for the operation
    pub timeout: Option<Duration>,
}

impl OperationContext {
    /// Context with no progress, no timeout and a fresh token
    pub fn new() -> Self {
        Self::default()
    }

    /// Report progress to `progress`
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Share an existing cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bound the operation by `timeout`
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail fast if the caller has cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ContentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` under this context's timeout and cancellation
    ///
    /// The future is dropped on cancellation or timeout, which releases any
    /// in-flight store writer and its partial file.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| ContentError::Timeout(limit))?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ContentError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_prefers_bytes() {
        let event = ProgressEvent::new("deliver", None, 50, Some(200), 0, 4);
        assert!((event.percentage - 25.0).abs() < f64::EPSILON);

        let event = ProgressEvent::new("prepare", None, 0, None, 3, 4);
        assert!((event.percentage - 75.0).abs() < f64::EPSILON);

        let event = ProgressEvent::new("prepare", None, 0, Some(0), 0, 0);
        assert!(event.percentage.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_sink_never_blocks() {
        let (sink, mut rx) = progress_channel(1);
        sink.emit(ProgressEvent::new("a", None, 1, None, 0, 0));
        sink.emit(ProgressEvent::new("b", None, 2, None, 0, 0));
        let first = rx.recv().await.expect("event");
        assert_eq!(first.operation, "a");
        assert!(rx.try_recv().is_err());

        drop(rx);
        sink.emit(ProgressEvent::new("c", None, 3, None, 0, 0));
        assert!(!sink.is_active());
        ProgressSink::none().emit(ProgressEvent::new("d", None, 0, None, 0, 0));
    }

    #[tokio::test]
    async fn test_guard_cancellation_and_timeout() {
        let ctx = OperationContext::new();
        ctx.cancel.cancel();
        let result = ctx.guard(async { Ok::<_, ContentError>(1) }).await;
        assert!(matches!(result, Err(ContentError::Cancelled)));

        let ctx = OperationContext::new().with_timeout(Duration::from_millis(10));
        let result = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ContentError>(())
            })
            .await;
        assert!(matches!(result, Err(ContentError::Timeout(_))));

        let ctx = OperationContext::new();
        assert_eq!(ctx.guard(async { Ok::<_, ContentError>(7) }).await.expect("ok"), 7);
    }
}
