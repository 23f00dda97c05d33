//! Persistence seams for newsletters, recipients and delivery outcomes.
//!
//! Every backend implements the three traits; services hold an `Arc<dyn Store>`.

mod memory;
mod postgres;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    DeliveryRecord, DeliveryStatus, Newsletter, NewsletterContent, NewsletterStatus, Recipient,
};
use crate::utils::error_chain_fmt;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(thiserror::Error)]
pub enum StoreError {
    #[error("Failed to execute a database query")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Conflict(String),
    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("The store is unavailable")]
    Unavailable,
}

impl Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub active_recipients: i64,
    pub total_recipients: i64,
    pub sent_newsletters: i64,
    pub last_sent: Option<LastSent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastSent {
    pub title: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait NewsletterStore: Send + Sync {
    async fn insert_newsletter(&self, newsletter: &Newsletter) -> Result<(), StoreError>;

    async fn newsletter(&self, id: Uuid) -> Result<Option<Newsletter>, StoreError>;

    /// Newest first.
    async fn newsletters(&self) -> Result<Vec<Newsletter>, StoreError>;

    /// Replaces the content of a draft. Returns false when the newsletter is
    /// missing or no longer a draft.
    async fn update_draft(&self, id: Uuid, content: &NewsletterContent)
        -> Result<bool, StoreError>;

    /// Refused while the newsletter is being sent.
    async fn delete_newsletter(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Moves the newsletter to `scheduled` at `at`, provided its current status
    /// is one of `from`.
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        from: &[NewsletterStatus],
    ) -> Result<bool, StoreError>;

    async fn unschedule(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Scheduled newsletters whose time has come, by the store's clock.
    async fn due_newsletters(&self) -> Result<Vec<Newsletter>, StoreError>;

    async fn failed_newsletters(&self, max_attempts: i32) -> Result<Vec<Newsletter>, StoreError>;

    /// Compare-and-swap `observed` to `sending`, remembering the audience of the
    /// dispatch. Exactly one concurrent caller wins.
    async fn claim(
        &self,
        id: Uuid,
        observed: NewsletterStatus,
        audience: Option<&[Uuid]>,
    ) -> Result<bool, StoreError>;

    /// Ends a lease without recording outcomes.
    async fn release(&self, id: Uuid, status: NewsletterStatus) -> Result<(), StoreError>;

    async fn statistics(&self) -> Result<Statistics, StoreError>;
}

#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn insert_recipient(&self, recipient: &Recipient) -> Result<(), StoreError>;

    /// Returns false when the email is already known.
    async fn insert_recipient_if_absent(&self, recipient: &Recipient) -> Result<bool, StoreError>;

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError>;

    /// Newest first.
    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError>;

    /// Ordered by email.
    async fn active_recipients(&self) -> Result<Vec<Recipient>, StoreError>;

    async fn active_recipients_among(&self, ids: &[Uuid]) -> Result<Vec<Recipient>, StoreError>;

    async fn update_recipient(&self, recipient: &Recipient) -> Result<bool, StoreError>;

    async fn delete_recipient(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Idempotent. `None` when no recipient holds the token.
    async fn unsubscribe(&self, token: &str) -> Result<Option<Recipient>, StoreError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Recipients deleted in the meantime are skipped.
    async fn record_pending(
        &self,
        newsletter_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    /// Upserts every outcome and sets the final newsletter status atomically.
    /// Outcomes for recipients deleted during the dispatch are dropped.
    async fn finish_dispatch(
        &self,
        newsletter_id: Uuid,
        outcomes: &[(Uuid, DeliveryStatus)],
        status: NewsletterStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn deliveries(&self, newsletter_id: Uuid) -> Result<Vec<DeliveryRecord>, StoreError>;
}

pub trait Store: NewsletterStore + RecipientStore + DeliveryStore {}

impl<T> Store for T where T: NewsletterStore + RecipientStore + DeliveryStore {}
