use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::TaskEngine;
use crate::reconcile::ReconcileConfig;

/// Start the background watchdog loop.
///
/// One loop owns the tick: sleep, then run the heartbeat sweep and the
/// queue reconciliation sequentially. A new tick can never start while the
/// previous one is still running, and a failed cycle is logged, never
/// fatal. Submission and manual completion proceed on their own
/// request-driven paths and are not blocked by a tick.
///
/// Returns a CancellationToken that stops the loop when cancelled.
pub fn start(engine: Arc<TaskEngine>, config: ReconcileConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        let interval = config.tick_interval;

        tokio::spawn(async move {
            info!("task watchdog started (interval={interval:?})");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("task watchdog stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("watchdog tick");
                        if let Err(e) = engine.run_reconcile_cycle(&config) {
                            error!("watchdog cycle failed: {e}");
                        }
                    }
                }
            }
        });
    }

    cancel
}
