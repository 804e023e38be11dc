//! Periodic status reconciliation

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::deploy::executor::BotExecutor;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Reconciler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between passes
    pub interval: Duration,

    /// Initial delay before the first pass
    pub initial_delay: Duration,

    /// Backoff applied after failed passes
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run the reconciler worker
pub async fn run<S, F>(
    options: &Options,
    executor: &BotExecutor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reconciler worker starting...");
    let mut wait = options.initial_delay;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reconciler worker shutting down...");
                return;
            }
            _ = sleep_fn(wait) => {}
        }

        match executor.reconcile().await {
            Ok(report) => {
                debug!("Reconciled {} bots, {} updated", report.checked, report.updated);
                failures = 0;
                wait = options.interval;
            }
            Err(e) => {
                failures += 1;
                wait = calc_exp_backoff(&options.cooldown, failures).max(options.interval);
                error!("Reconciliation failed (retrying in {:?}): {}", wait, e);
            }
        }
    }
}
