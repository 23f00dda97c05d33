//! Turns one newsletter into delivered messages and a durable record of the outcome.
//!
//! A dispatch takes a lease on the newsletter (compare-and-swap to `sending`)
//! before touching the relay, so at most one dispatch of a given newsletter is in
//! flight. Every failure after the lease ends in a terminal status.

mod compose;

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelSession, DeliveryChannel, OutgoingMessage};
use crate::domain::{DeliveryStatus, Newsletter, NewsletterStatus, Recipient, SubscriberEmail};
use crate::store::{Store, StoreError};
use crate::utils::error_chain_fmt;

pub use compose::{Batch, Composer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    AllActive,
    /// Active recipients among these ids; unknown or unsubscribed ids are ignored.
    Selected(Vec<Uuid>),
    /// The audience remembered from the newsletter's last dispatch, minus the
    /// recipients it already reached.
    Outstanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator-requested send; terminal newsletters may be sent again.
    Interactive,
    /// Scheduler-initiated; only a `scheduled` newsletter is claimed.
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub newsletter_id: Uuid,
    pub status: NewsletterStatus,
    pub sent: usize,
    pub failed: usize,
}

#[derive(thiserror::Error)]
pub enum DispatchError {
    #[error("Newsletter {0} does not exist")]
    NotFound(Uuid),
    #[error("There are no active recipients to send the newsletter to")]
    NoRecipients,
    #[error("Newsletter {0} is already being sent")]
    AlreadyInProgress(Uuid),
    #[error("Failed to open a session with the relay")]
    ChannelConnectFailed(#[source] ChannelError),
    #[error("{} recipients could not be reached", .report.failed)]
    SendFailed {
        report: DispatchReport,
        #[source]
        source: ChannelError,
    },
    #[error("Failed to access the store")]
    Store(#[from] StoreError),
}

impl Debug for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    channel: Arc<dyn DeliveryChannel>,
    composer: Composer,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<dyn DeliveryChannel>,
        composer: Composer,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            composer,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    #[tracing::instrument(
        name = "Dispatching a newsletter",
        skip(self, audience),
        fields(newsletter_id = %id, trigger = ?trigger)
    )]
    pub async fn dispatch(
        &self,
        id: Uuid,
        audience: Audience,
        trigger: Trigger,
    ) -> Result<DispatchReport, DispatchError> {
        let newsletter = self
            .store
            .newsletter(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;
        let observed = newsletter.status;
        let claimable = match trigger {
            Trigger::Schedule => observed == NewsletterStatus::Scheduled,
            Trigger::Interactive => observed != NewsletterStatus::Sending,
        };
        if !claimable {
            return Err(DispatchError::AlreadyInProgress(id));
        }

        let recipients = match &audience {
            Audience::AllActive => self.store.active_recipients().await?,
            Audience::Selected(ids) => self.store.active_recipients_among(ids).await?,
            Audience::Outstanding => self.outstanding_recipients(&newsletter).await?,
        };
        if recipients.is_empty() {
            tracing::warn!("No active recipients, leaving the newsletter as {}", observed);
            return Err(DispatchError::NoRecipients);
        }

        let remembered: Option<Vec<Uuid>> = match audience {
            Audience::AllActive => None,
            Audience::Selected(_) => Some(recipients.iter().map(|r| r.id).collect()),
            Audience::Outstanding => newsletter.audience.clone(),
        };
        if !self.store.claim(id, observed, remembered.as_deref()).await? {
            return Err(DispatchError::AlreadyInProgress(id));
        }

        let outcome = self.deliver(&newsletter, &recipients).await;
        if let Err(DispatchError::Store(_)) | Err(DispatchError::ChannelConnectFailed(_)) = &outcome
        {
            self.release_to_error(id).await;
        }
        outcome
    }

    /// Sends the newsletter to one ad-hoc address. Never records deliveries or
    /// touches the stored status.
    #[tracing::instrument(
        name = "Sending a test newsletter",
        skip(self),
        fields(newsletter_id = %id)
    )]
    pub async fn send_test(
        &self,
        id: Uuid,
        address: &SubscriberEmail,
    ) -> Result<DispatchReport, DispatchError> {
        let newsletter = self
            .store
            .newsletter(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;

        let mut session = self.open().await?;
        let message = self.composer.compose_test(&newsletter, address);
        let outcome = self.send(session.as_mut(), &message).await;
        self.close(session).await;

        let mut report = DispatchReport {
            newsletter_id: id,
            status: newsletter.status,
            sent: 0,
            failed: 0,
        };
        match outcome {
            Ok(()) => {
                report.sent = 1;
                Ok(report)
            }
            Err(source) => {
                report.failed = 1;
                Err(DispatchError::SendFailed { report, source })
            }
        }
    }

    /// Opens and closes a relay session.
    #[tracing::instrument(name = "Checking the relay", skip(self))]
    pub async fn check_relay(&self) -> Result<(), ChannelError> {
        let session = match timeout(self.timeout, self.channel.open()).await {
            Ok(session) => session?,
            Err(_) => return Err(ChannelError::Timeout(self.timeout)),
        };
        session.close().await
    }

    async fn outstanding_recipients(
        &self,
        newsletter: &Newsletter,
    ) -> Result<Vec<Recipient>, StoreError> {
        let mut recipients = match &newsletter.audience {
            None => self.store.active_recipients().await?,
            Some(ids) => self.store.active_recipients_among(ids).await?,
        };
        let reached: HashSet<Uuid> = self
            .store
            .deliveries(newsletter.id)
            .await?
            .into_iter()
            .filter(|record| record.status == DeliveryStatus::Sent)
            .map(|record| record.recipient_id)
            .collect();
        recipients.retain(|r| !reached.contains(&r.id));
        Ok(recipients)
    }

    async fn deliver(
        &self,
        newsletter: &Newsletter,
        recipients: &[Recipient],
    ) -> Result<DispatchReport, DispatchError> {
        let id = newsletter.id;
        let mut session = self.open().await?;

        let recipient_ids: Vec<Uuid> = recipients.iter().map(|r| r.id).collect();
        if let Err(e) = self.store.record_pending(id, &recipient_ids).await {
            self.close(session).await;
            return Err(e.into());
        }

        let mut outcomes = Vec::with_capacity(recipients.len());
        let mut last_error = None;
        for batch in self.composer.compose(newsletter, recipients) {
            let outcome = match self.send(session.as_mut(), &batch.message).await {
                Ok(()) => DeliveryStatus::Sent,
                Err(e) => {
                    tracing::warn!(
                        error.cause_chain = ?e,
                        recipients = batch.recipient_ids.len(),
                        "A batch could not be sent",
                    );
                    last_error = Some(e);
                    DeliveryStatus::Error
                }
            };
            outcomes.extend(batch.recipient_ids.into_iter().map(|r| (r, outcome)));
        }
        self.close(session).await;

        let sent = outcomes
            .iter()
            .filter(|(_, o)| *o == DeliveryStatus::Sent)
            .count();
        let failed = outcomes.len() - sent;
        let status = NewsletterStatus::from_outcomes(sent, failed);
        self.store
            .finish_dispatch(id, &outcomes, status, Utc::now())
            .await?;

        let report = DispatchReport {
            newsletter_id: id,
            status,
            sent,
            failed,
        };
        tracing::info!(%status, sent, failed, "Dispatch finished");
        match last_error {
            None => Ok(report),
            Some(source) => Err(DispatchError::SendFailed { report, source }),
        }
    }

    async fn open(&self) -> Result<Box<dyn ChannelSession>, DispatchError> {
        match timeout(self.timeout, self.channel.open()).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(DispatchError::ChannelConnectFailed(e)),
            Err(_) => Err(DispatchError::ChannelConnectFailed(ChannelError::Timeout(
                self.timeout,
            ))),
        }
    }

    async fn send(
        &self,
        session: &mut dyn ChannelSession,
        message: &OutgoingMessage,
    ) -> Result<(), ChannelError> {
        match timeout(self.timeout, session.send(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Timeout(self.timeout)),
        }
    }

    async fn close(&self, session: Box<dyn ChannelSession>) {
        if let Err(e) = session.close().await {
            tracing::warn!(error.cause_chain = ?e, "Failed to close the relay session");
        }
    }

    async fn release_to_error(&self, id: Uuid) {
        if let Err(e) = self.store.release(id, NewsletterStatus::Error).await {
            tracing::error!(error.cause_chain = ?e, "Failed to release newsletter {}", id);
        }
    }
}
