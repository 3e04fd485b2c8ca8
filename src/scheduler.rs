//! Host scheduler driving reconciliation passes.
//!
//! One loop per subscription guarantees at-most-one concurrent pass per
//! subscription id while distinct subscriptions reconcile in parallel. On
//! shutdown the in-flight pass is dropped at the `select!`, so no partial
//! status is persisted beyond the driver's documented speculative
//! `last_attempted_version` write.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::RECONCILE_STAGGER_DELAY_MS;
use crate::replication::driver::ReconcileDriver;
use crate::subscription::Subscription;

pub struct Scheduler {
    driver: Arc<ReconcileDriver>,
}

impl Scheduler {
    pub fn new(driver: Arc<ReconcileDriver>) -> Self {
        Self { driver }
    }

    /// Reconcile every subscription on its own interval until `shutdown`
    /// fires. Loop starts are staggered to avoid hammering a registry shared
    /// by many subscriptions.
    pub async fn run(&self, subscriptions: Vec<Subscription>, shutdown: watch::Receiver<bool>) {
        let loops = subscriptions.into_iter().enumerate().map(|(i, subscription)| {
            let driver = Arc::clone(&self.driver);
            let mut shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(RECONCILE_STAGGER_DELAY_MS * i as u64)).await;
                info!(subscription = %subscription.id, "starting reconcile loop");

                loop {
                    let delay = tokio::select! {
                        _ = shutdown.changed() => break,
                        result = driver.reconcile_once(&subscription) => match result {
                            Ok(success) => {
                                debug!(
                                    subscription = %subscription.id,
                                    outcome = ?success.outcome,
                                    "reconciliation pass finished"
                                );
                                success.requeue_after
                            }
                            Err(err) => {
                                error!(subscription = %subscription.id, error = %err, "reconciliation pass failed");
                                subscription.interval
                            }
                        },
                    };

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(delay) => {}
                    }
                }

                info!(subscription = %subscription.id, "reconcile loop stopped");
            }
        });

        join_all(loops).await;
    }
}
