use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::Context;
use crate::observability::COMPACTIONS_TOTAL;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once the journal has grown by `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(ctx: &Context, threshold: u64) -> bool {
    if ctx.journal.appends_since_compact().await < threshold {
        return false;
    }
    match ctx.compact().await {
        Ok(kept) => {
            info!("journal compacted to {kept} events");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("journal compaction failed: {e}");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

/// Background task that keeps the journal from growing without bound.
pub async fn run_compactor(
    ctx: Arc<Context>,
    threshold: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                compact_if_needed(&ctx, threshold).await;
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let dir = std::env::temp_dir().join("parkd_test_compactor");
        let _ = std::fs::remove_dir_all(&dir);
        let ctx = Context::open(&dir).unwrap();

        let lot = Ulid::new();
        for _ in 0..3 {
            ctx.engine.create_resource(Ulid::new(), lot, None).await.unwrap();
        }
        assert!(!compact_if_needed(&ctx, 10).await);
        assert!(compact_if_needed(&ctx, 3).await);
        assert_eq!(ctx.journal.appends_since_compact().await, 0);

        drop(ctx);
        let ctx = Context::open(&dir).unwrap();
        assert_eq!(ctx.engine.list_resources().await.len(), 3);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let dir = std::env::temp_dir().join("parkd_test_compactor_cancel");
        let _ = std::fs::remove_dir_all(&dir);
        let ctx = Arc::new(Context::open(&dir).unwrap());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_compactor(ctx, 1, Duration::from_millis(10), cancel.clone()));
        cancel.cancel();
        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(5), task).await);
    }
}
