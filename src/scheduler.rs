use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::configuration::{RetrySettings, SchedulerSettings};
use crate::dispatcher::{Audience, DispatchError, Dispatcher, Trigger};
use crate::domain::NewsletterStatus;
use crate::store::StoreError;

const MAX_BACKOFF_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// What one wake-up of the loop did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub requeued: usize,
}

pub struct Scheduler {
    dispatcher: Dispatcher,
    interval: StdDuration,
    retry: RetrySettings,
}

impl Scheduler {
    pub fn new(dispatcher: Dispatcher, settings: &SchedulerSettings) -> Self {
        Self {
            dispatcher,
            interval: settings.interval(),
            retry: settings.retry.clone(),
        }
    }

    /// Ticks until a stop signal arrives or every sender is gone. A tick that
    /// has started always runs to completion.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary == TickSummary::default() => {}
                        Ok(summary) => tracing::info!(?summary, "Scheduler tick finished"),
                        Err(e) => tracing::error!(error.cause_chain = ?e, "Scheduler tick failed"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!("Scheduler stopped");
    }

    #[tracing::instrument(name = "Scheduler tick", skip(self))]
    pub async fn tick(&self) -> Result<TickSummary, StoreError> {
        let mut summary = TickSummary::default();
        if self.retry.enabled {
            summary.requeued = self.requeue_failed().await?;
        }

        let due = self.dispatcher.store().due_newsletters().await?;
        summary.due = due.len();

        for newsletter in due {
            let id = newsletter.id;
            let dispatcher = self.dispatcher.clone();
            let handle = tokio::spawn(async move {
                dispatcher
                    .dispatch(id, Audience::Outstanding, Trigger::Schedule)
                    .await
            });

            match handle.await {
                Ok(Ok(report)) => {
                    tracing::info!(
                        newsletter_id = %id,
                        sent = report.sent,
                        "Scheduled newsletter sent"
                    );
                    summary.sent += 1;
                }
                Ok(Err(e @ DispatchError::AlreadyInProgress(_)))
                | Ok(Err(e @ DispatchError::NoRecipients)) => {
                    tracing::warn!(
                        newsletter_id = %id,
                        error.cause_chain = ?e,
                        "Skipping scheduled newsletter"
                    );
                    summary.skipped += 1;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        newsletter_id = %id,
                        error.cause_chain = ?e,
                        "Scheduled newsletter failed"
                    );
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::error!(newsletter_id = %id, error = %e, "Dispatch task panicked");
                    if let Err(e) = self
                        .dispatcher
                        .store()
                        .release(id, NewsletterStatus::Error)
                        .await
                    {
                        tracing::error!(
                            error.cause_chain = ?e,
                            "Failed to release newsletter {}",
                            id
                        );
                    }
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn requeue_failed(&self) -> Result<usize, StoreError> {
        let store = self.dispatcher.store();
        let failed = store.failed_newsletters(self.retry.max_attempts).await?;
        let now = Utc::now();

        let mut requeued = 0;
        for newsletter in failed {
            let at = retry_at(now, newsletter.attempts, self.retry.backoff_seconds);
            if store
                .reschedule(newsletter.id, at, &[NewsletterStatus::Error])
                .await?
            {
                tracing::info!(
                    newsletter_id = %newsletter.id,
                    attempts = newsletter.attempts,
                    %at,
                    "Requeued failed newsletter"
                );
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

/// Exponential backoff from the number of attempts already made, capped at a day.
fn retry_at(now: DateTime<Utc>, attempts: i32, backoff_seconds: i64) -> DateTime<Utc> {
    let exponent = (attempts - 1).clamp(0, 30) as u32;
    let seconds = backoff_seconds
        .max(0)
        .saturating_mul(2_i64.saturating_pow(exponent))
        .min(MAX_BACKOFF_SECONDS);
    now + Duration::seconds(seconds)
}
