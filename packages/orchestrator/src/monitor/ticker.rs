//! Background loops with a per-tick deadline.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Run `tick` every `every` until `cancel` fires.
///
/// Each tick runs in its own task under `deadline`. A tick that fails, overruns
/// or panics is logged and the loop carries on with the next interval.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    deadline: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut run = tokio::spawn(tokio::time::timeout(deadline, tick()));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    run.abort();
                    break;
                }
                outcome = &mut run => outcome,
            };

            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(loop_name = name, error = %e, "Periodic tick failed"),
                Ok(Err(_)) => warn!(loop_name = name, ?deadline, "Periodic tick timed out"),
                Err(e) if e.is_panic() => error!(loop_name = name, "Periodic tick panicked"),
                Err(_) => {}
            }
        }

        debug!(loop_name = name, "Periodic loop stopped");
    })
}
