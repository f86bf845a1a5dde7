use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SweepConfig;
use crate::dispatch::Dispatcher;

/// Background loops that keep the controller moving without outside input:
///
/// - **dispatch**: runs a pass on every tick, and early whenever a submission,
///   activation or finished job wakes it
/// - **liveness**: marks agents with stale heartbeats unreachable
/// - **expiry**: expires long-queued jobs, stops jobs past their maximum
///   duration, purges long-unreachable agents and forgets old idempotency keys
///
/// Each loop logs its own errors and keeps going until `shutdown` is cancelled.
pub struct Sweeper {
    dispatcher: Dispatcher,
    config: SweepConfig,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(dispatcher: Dispatcher, config: SweepConfig, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Spawn all three loops.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::dispatch_loop(
                self.dispatcher.clone(),
                self.config.dispatch_interval(),
                self.shutdown.clone(),
            )),
            tokio::spawn(Self::liveness_loop(
                self.dispatcher.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            )),
            tokio::spawn(Self::expiry_loop(
                self.dispatcher,
                self.config,
                self.shutdown,
            )),
        ]
    }

    async fn dispatch_loop(dispatcher: Dispatcher, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = dispatcher.woken() => {}
            }

            if let Err(e) = dispatcher.dispatch_pass().await {
                tracing::warn!(error = %e, "Dispatch pass failed");
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }

    async fn liveness_loop(dispatcher: Dispatcher, config: SweepConfig, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(config.liveness_interval());
        let timeout = config.heartbeat_timeout();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match dispatcher.sweep_liveness(timeout, Utc::now()).await {
                Ok(marked) if !marked.is_empty() => {
                    tracing::info!(agents = marked.len(), "Marked stale agents unreachable")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Liveness sweep failed"),
            }
        }
        tracing::debug!("Liveness loop stopped");
    }

    async fn expiry_loop(dispatcher: Dispatcher, config: SweepConfig, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(config.expiry_interval());
        let job_ttl = config.job_ttl();
        let agent_expiry = config.agent_expiry();
        let retention = config.idempotency_retention();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match dispatcher
                .sweep_expired(job_ttl, agent_expiry, Utc::now())
                .await
            {
                Ok(report) => {
                    if !report.expired_jobs.is_empty() || !report.purged_agents.is_empty() {
                        tracing::info!(
                            jobs = report.expired_jobs.len(),
                            agents = report.purged_agents.len(),
                            "Expiry sweep"
                        );
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
            }

            match dispatcher.sweep_overruns(Utc::now()).await {
                Ok(stopped) if !stopped.is_empty() => {
                    tracing::info!(jobs = stopped.len(), "Stopped jobs past their duration")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Overrun sweep failed"),
            }

            if let Err(e) = dispatcher.prune_idempotency(retention, Utc::now()).await {
                tracing::warn!(error = %e, "Idempotency pruning failed");
            }
        }
        tracing::debug!("Expiry loop stopped");
    }
}
