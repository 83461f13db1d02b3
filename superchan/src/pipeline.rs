//! Two-stage pipelines with drop-on-full forwarding.
//!
//! Items sent to the inbound stage are passed to a handler inside a
//! [`Slot`]. Whatever is left in the slot is offered to the outbound stage
//! without waiting: if the outbound buffer is full the item is dropped and
//! the inbound stage moves on.

use crate::config::SuperchanConfig;
use crate::context::Context;
use crate::errors::Cause;
use crate::superchan::{guarded, Superchan};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// The item travelling from the inbound to the outbound stage.
///
/// Handlers may replace the value, change it in place, or empty the slot to
/// stop the item from being forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<T>(Option<T>);

impl<T> Slot<T> {
    /// Creates a slot holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self(Some(value))
    }

    /// Returns the value, if it is still to be forwarded.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }

    /// Mutable access to the value.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.0.as_mut()
    }

    /// Replaces the value.
    pub fn set(&mut self, value: T) {
        self.0 = Some(value);
    }

    /// Removes and returns the value, leaving the slot empty.
    pub fn take(&mut self) -> Option<T> {
        self.0.take()
    }

    /// Empties the slot so nothing is forwarded.
    pub fn suppress(&mut self) {
        self.0 = None;
    }

    /// Returns true if nothing will be forwarded.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.0.is_none()
    }

    /// Transforms the value, if any.
    #[must_use]
    pub fn map(self, f: impl FnOnce(T) -> T) -> Self {
        Self(self.0.map(f))
    }

    /// Consumes the slot.
    pub fn into_inner(self) -> Option<T> {
        self.0
    }
}

/// Counters for the forwarding step.
#[derive(Debug, Default)]
pub struct ForwardMetrics {
    /// Items enqueued on the outbound stage.
    forwarded: AtomicU64,
    /// Items dropped because the outbound stage was full or closed.
    dropped: AtomicU64,
    /// Items the handler chose not to forward.
    suppressed: AtomicU64,
}

impl ForwardMetrics {
    fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_suppress(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of forwarded items.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped items.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of suppressed items.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage of forward attempts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate(&self) -> f64 {
        let forwarded = self.forwarded();
        let dropped = self.dropped();
        let total = forwarded + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to a JSON object.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "forwarded": self.forwarded(),
            "dropped": self.dropped(),
            "suppressed": self.suppressed(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0
        })
    }
}

/// Builds a two-stage pipeline with the default configuration.
///
/// Returns `(inbound, outbound)`. The outbound scope is a child of the
/// inbound scope. Must be called from within a tokio runtime.
pub fn new_pipeline<T, F, Fut>(
    parent: &Context,
    handler: F,
    parallel: bool,
) -> (Superchan<T>, Superchan<T>)
where
    T: Send + 'static,
    F: Fn(Context, Slot<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Slot<T>, Cause>> + Send + 'static,
{
    SuperchanConfig::default().pipeline(parent, handler, parallel)
}

impl SuperchanConfig {
    /// Builds a two-stage pipeline. See [`new_pipeline`].
    ///
    /// Both stages use this configuration, including its buffer size.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn pipeline<T, F, Fut>(
        &self,
        parent: &Context,
        handler: F,
        parallel: bool,
    ) -> (Superchan<T>, Superchan<T>)
    where
        T: Send + 'static,
        F: Fn(Context, Slot<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Slot<T>, Cause>> + Send + 'static,
    {
        let metrics = Arc::new(ForwardMetrics::default());
        let inbound = Superchan::build(parent, self.clone(), None);
        let outbound = Superchan::build(inbound.context(), self.clone(), Some(Arc::clone(&metrics)));

        tokio::spawn(pipeline_loop(
            Stages {
                inbound: inbound.clone(),
                outbound: outbound.clone(),
                metrics,
            },
            Arc::new(handler),
            parallel,
        ));
        (inbound, outbound)
    }
}

/// Both stages of one pipeline plus the counters its forwarder updates.
struct Stages<T> {
    inbound: Superchan<T>,
    outbound: Superchan<T>,
    metrics: Arc<ForwardMetrics>,
}

impl<T> Clone for Stages<T> {
    fn clone(&self) -> Self {
        Self {
            inbound: self.inbound.clone(),
            outbound: self.outbound.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

async fn pipeline_loop<T, F, Fut>(stages: Stages<T>, handler: Arc<F>, parallel: bool)
where
    T: Send + 'static,
    F: Fn(Context, Slot<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Slot<T>, Cause>> + Send + 'static,
{
    let inbound = &stages.inbound;
    let outbound = &stages.outbound;

    while !inbound.is_cancelled() && !outbound.is_cancelled() {
        tokio::select! {
            () = inbound.done() => {}
            () = outbound.done() => {}
            item = inbound.recv() => match item {
                Some(item) if parallel => {
                    tokio::spawn(forward(stages.clone(), Arc::clone(&handler), item));
                }
                Some(item) => forward(stages.clone(), Arc::clone(&handler), item).await,
                None => inbound.cancel(Cause::msg("superchan: channel closed")),
            },
        }
    }

    // Outbound ended on its own: report its cause upstream too.
    if let Some(cause) = outbound.cause() {
        inbound.cancel(cause);
    }

    inbound.run_deferred().await;
    if let Err(violation) = outbound.try_run_deferred().await {
        debug!("outbound cleanup skipped: {}", violation);
    }

    let _ = inbound.try_close();
    let _ = outbound.try_close();
}

/// Runs the handler for one item and offers the result downstream.
async fn forward<T, F, Fut>(stages: Stages<T>, handler: Arc<F>, item: T)
where
    F: Fn(Context, Slot<T>) -> Fut,
    Fut: Future<Output = Result<Slot<T>, Cause>>,
{
    let Stages {
        inbound,
        outbound,
        metrics,
    } = stages;
    if inbound.is_cancelled() || outbound.is_cancelled() {
        return;
    }

    let ctx = outbound.context().clone();
    let slot = match guarded(async move { (*handler)(ctx, Slot::new(item)).await }).await {
        Ok(slot) => slot,
        Err(cause) => {
            debug!(cause = %cause, "pipeline handler failed, cancelling");
            inbound.cancel(cause);
            return;
        }
    };

    let Some(value) = slot.into_inner() else {
        metrics.record_suppress();
        return;
    };

    match outbound.sender().try_send(value) {
        Ok(()) => metrics.record_forward(),
        Err(TrySendError::Full(_)) => {
            trace!("outbound full, dropping item");
            metrics.record_drop();
        }
        Err(TrySendError::Closed(_)) => metrics.record_drop(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config(buffer_size: usize) -> SuperchanConfig {
        SuperchanConfig::new()
            .with_buffer_size(buffer_size)
            .with_max_wait(Duration::from_millis(500))
            .with_poll_interval(Duration::from_millis(1))
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_slot_operations() {
        let mut slot = Slot::new(2);
        assert_eq!(slot.get(), Some(&2));

        if let Some(v) = slot.get_mut() {
            *v += 1;
        }
        assert_eq!(slot.clone().into_inner(), Some(3));

        let slot = slot.map(|v| v * 10);
        assert_eq!(slot.get(), Some(&30));

        let mut slot = slot;
        assert_eq!(slot.take(), Some(30));
        assert!(slot.is_suppressed());

        slot.set(5);
        assert!(!slot.is_suppressed());
        slot.suppress();
        assert_eq!(slot.into_inner(), None);
    }

    #[test]
    fn test_metrics_drop_rate() {
        let metrics = ForwardMetrics::default();
        assert!(metrics.drop_rate().abs() < f64::EPSILON);

        metrics.record_forward();
        metrics.record_forward();
        metrics.record_forward();
        metrics.record_drop();
        metrics.record_suppress();

        assert!((metrics.drop_rate() - 25.0).abs() < f64::EPSILON);
        let dict = metrics.to_dict();
        assert_eq!(dict["forwarded"], 3);
        assert_eq!(dict["dropped"], 1);
        assert_eq!(dict["suppressed"], 1);
    }

    #[tokio::test]
    async fn test_forward_counts_into_given_metrics() {
        let settings = config(2);
        let inbound: Superchan<u32> = settings.raw(&Context::new());
        // A stage built without counters still receives forwarded items.
        let outbound: Superchan<u32> = settings.raw(inbound.context());
        let metrics = Arc::new(ForwardMetrics::default());
        let stages = Stages {
            inbound,
            outbound: outbound.clone(),
            metrics: Arc::clone(&metrics),
        };
        let handler = Arc::new(|_ctx: Context, slot: Slot<u32>| async move { Ok::<_, Cause>(slot) });

        forward(stages.clone(), Arc::clone(&handler), 7).await;
        forward(stages.clone(), Arc::clone(&handler), 8).await;
        forward(stages, handler, 9).await;

        assert_eq!(outbound.drain().await, vec![7, 8]);
        assert_eq!(metrics.forwarded(), 2);
        assert_eq!(metrics.dropped(), 1);
        assert!(outbound.forward_metrics().is_none());
    }

    #[tokio::test]
    async fn test_forwards_transformed_items() {
        let (inbound, outbound) = config(8).pipeline(
            &Context::new(),
            |_ctx, slot: Slot<u32>| async move { Ok(slot.map(|v| v * 2)) },
            false,
        );

        for i in 1..=3 {
            inbound.sender().send(i).await.unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            let item = tokio::time::timeout(Duration::from_secs(1), outbound.recv()).await.unwrap();
            got.push(item.unwrap());
        }
        assert_eq!(got, vec![2, 4, 6]);
        assert_eq!(outbound.forward_metrics().unwrap().forwarded(), 3);
        assert!(inbound.forward_metrics().is_none());
    }

    #[tokio::test]
    async fn test_full_outbound_drops_without_blocking() {
        let (inbound, outbound) = config(1).pipeline(
            &Context::new(),
            |_ctx, slot: Slot<&'static str>| async move { Ok(slot) },
            false,
        );
        let metrics = || outbound.forward_metrics().unwrap();

        inbound.sender().send("X").await.unwrap();
        eventually(|| metrics().forwarded() == 1).await;

        inbound.sender().send("Y").await.unwrap();
        eventually(|| metrics().dropped() == 1).await;

        assert!(!inbound.is_cancelled());
        assert_eq!(outbound.drain().await, vec!["X"]);

        // The inbound stage is still alive and keeps forwarding.
        inbound.sender().send("Z").await.unwrap();
        eventually(|| metrics().forwarded() == 2).await;
        assert_eq!(outbound.drain().await, vec!["Z"]);
    }

    #[tokio::test]
    async fn test_suppressed_items_are_not_forwarded() {
        let (inbound, outbound) = config(8).pipeline(
            &Context::new(),
            |_ctx, mut slot: Slot<u32>| async move {
                if slot.get().is_some_and(|v| v % 2 == 1) {
                    slot.suppress();
                }
                Ok(slot)
            },
            false,
        );

        for i in 1..=4 {
            inbound.sender().send(i).await.unwrap();
        }
        eventually(|| {
            let m = outbound.forward_metrics().unwrap();
            m.forwarded() + m.suppressed() == 4
        })
        .await;

        assert_eq!(outbound.drain().await, vec![2, 4]);
        assert_eq!(outbound.forward_metrics().unwrap().suppressed(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_cancels_inbound() {
        let processed = Arc::new(AtomicUsize::new(0));
        let seen = processed.clone();
        let (inbound, outbound) = config(8).pipeline(
            &Context::new(),
            move |_ctx, slot: Slot<&'static str>| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if slot.get() == Some(&"Z") {
                        return Err(Cause::msg("bad item Z"));
                    }
                    Ok(slot)
                }
            },
            false,
        );
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        inbound.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let tx = inbound.sender();
        tx.send("Z").await.unwrap();
        let _ = tx.send("after").await;

        let cause = tokio::time::timeout(Duration::from_secs(2), inbound.wait()).await.unwrap();
        assert_eq!(cause.to_string(), "bad item Z");
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(inbound.is_dead());

        // The child stage shares the cause and is cleaned up as well.
        assert!(outbound.cause().unwrap().ptr_eq(&cause));
        eventually(|| outbound.is_dead()).await;
        assert_eq!(outbound.forward_metrics().unwrap().forwarded(), 0);
    }

    #[tokio::test]
    async fn test_outbound_cancel_reported_on_inbound() {
        let (inbound, outbound) = config(8).pipeline(
            &Context::new(),
            |_ctx, slot: Slot<u32>| async move { Ok(slot) },
            false,
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        let inbound_log = order.clone();
        inbound.defer(move || inbound_log.lock().push("inbound"));
        let outbound_log = order.clone();
        outbound.defer(move || outbound_log.lock().push("outbound"));

        let cause = Cause::msg("consumer gone");
        outbound.cancel(cause.clone());

        let seen = tokio::time::timeout(Duration::from_secs(2), inbound.wait()).await.unwrap();
        assert!(seen.ptr_eq(&cause));
        eventually(|| outbound.is_dead()).await;
        assert_eq!(*order.lock(), vec!["inbound", "outbound"]);
    }

    #[tokio::test]
    async fn test_inbound_cancel_reaches_outbound_scope() {
        let parent = Context::new();
        let (inbound, outbound) = config(4).pipeline(
            &parent,
            |_ctx, slot: Slot<u32>| async move { Ok(slot) },
            false,
        );
        assert!(!outbound.is_cancelled());

        parent.cancel(Cause::msg("parent stop"));

        let cause = tokio::time::timeout(Duration::from_secs(2), inbound.wait()).await.unwrap();
        assert_eq!(cause.to_string(), "parent stop");
        assert!(outbound.is_cancelled());
    }

    #[tokio::test]
    async fn test_channels_closed_after_shutdown() {
        let (inbound, outbound) = config(4).pipeline(
            &Context::new(),
            |_ctx, slot: Slot<u32>| async move { Ok(slot) },
            false,
        );
        inbound.sender().send(9).await.unwrap();
        eventually(|| outbound.forward_metrics().unwrap().forwarded() == 1).await;

        inbound.cancel_default();
        inbound.wait().await;
        eventually(|| outbound.is_closed()).await;

        assert!(inbound.is_closed());
        assert_eq!(outbound.recv().await, Some(9));
        assert_eq!(outbound.recv().await, None);
        assert!(inbound.sender().try_send(1).is_err());
    }

    #[tokio::test]
    async fn test_parallel_pipeline_forwards_everything() {
        let (inbound, outbound) = config(16).pipeline(
            &Context::new(),
            |_ctx, slot: Slot<u32>| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(slot)
            },
            true,
        );

        for i in 0..10 {
            inbound.sender().send(i).await.unwrap();
        }
        eventually(|| outbound.forward_metrics().unwrap().forwarded() == 10).await;

        let mut got = outbound.drain().await;
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_handler_sees_outbound_context() {
        let (inbound, outbound) = config(4).pipeline(
            &Context::new(),
            |ctx: Context, slot: Slot<u32>| async move {
                ctx.cancel(Cause::msg("handler stopped downstream"));
                Ok(slot)
            },
            false,
        );
        inbound.sender().send(1).await.unwrap();

        let cause = tokio::time::timeout(Duration::from_secs(2), inbound.wait()).await.unwrap();
        assert_eq!(cause.to_string(), "handler stopped downstream");
        assert!(outbound.cause().unwrap().ptr_eq(&cause));
    }
}
