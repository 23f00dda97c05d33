use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::configuration::DatabaseSettings;
use crate::domain::{
    DeliveryRecord, DeliveryStatus, FontFamily, Newsletter, NewsletterContent, NewsletterStatus,
    Recipient, RecipientStatus, SubscriberEmail, SubscriberName, UnsubscribeToken,
};
use crate::store::{
    DeliveryStore, LastSent, NewsletterStore, RecipientStore, Statistics, StoreError,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect_lazy(settings: &DatabaseSettings) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy(settings.connection_string().expose_secret())?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[derive(FromRow)]
struct NewsletterRow {
    id: Uuid,
    title: String,
    subject: String,
    html_body: String,
    text_body: String,
    font: String,
    cc_addresses: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
    audience: Option<Vec<Uuid>>,
}

impl TryFrom<NewsletterRow> for Newsletter {
    type Error = StoreError;

    fn try_from(row: NewsletterRow) -> Result<Self, StoreError> {
        let cc = match row.cc_addresses {
            Some(cc) => serde_json::from_str::<Vec<String>>(&cc)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?
                .into_iter()
                .map(SubscriberEmail::parse)
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::Corrupt)?,
            None => vec![],
        };

        Ok(Newsletter {
            id: row.id,
            content: NewsletterContent {
                title: row.title,
                subject: row.subject,
                html_body: row.html_body,
                text_body: row.text_body,
                font: FontFamily::parse(row.font).map_err(StoreError::Corrupt)?,
                cc,
            },
            status: NewsletterStatus::try_from(row.status.as_str()).map_err(StoreError::Corrupt)?,
            created_at: row.created_at,
            sent_at: row.sent_at,
            scheduled_at: row.scheduled_at,
            attempts: row.attempts,
            audience: row.audience,
        })
    }
}

#[derive(FromRow)]
struct RecipientRow {
    id: Uuid,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: String,
    subscribed_at: DateTime<Utc>,
    unsubscribe_token: String,
}

impl TryFrom<RecipientRow> for Recipient {
    type Error = StoreError;

    fn try_from(row: RecipientRow) -> Result<Self, StoreError> {
        Ok(Recipient {
            id: row.id,
            email: SubscriberEmail::parse(row.email).map_err(StoreError::Corrupt)?,
            first_name: SubscriberName::parse_optional(row.first_name)
                .map_err(StoreError::Corrupt)?,
            last_name: SubscriberName::parse_optional(row.last_name)
                .map_err(StoreError::Corrupt)?,
            status: RecipientStatus::try_from(row.status.as_str()).map_err(StoreError::Corrupt)?,
            subscribed_at: row.subscribed_at,
            unsubscribe_token: UnsubscribeToken::parse(row.unsubscribe_token)
                .map_err(StoreError::Corrupt)?,
        })
    }
}

#[derive(FromRow)]
struct DeliveryRow {
    newsletter_id: Uuid,
    recipient_id: Uuid,
    status: String,
    recorded_at: DateTime<Utc>,
}

fn newsletters_from_rows(rows: Vec<NewsletterRow>) -> Result<Vec<Newsletter>, StoreError> {
    rows.into_iter().map(Newsletter::try_from).collect()
}

fn recipients_from_rows(rows: Vec<RecipientRow>) -> Result<Vec<Recipient>, StoreError> {
    rows.into_iter().map(Recipient::try_from).collect()
}

fn serialize_cc(cc: &[SubscriberEmail]) -> Result<Option<String>, StoreError> {
    if cc.is_empty() {
        return Ok(None);
    }
    let addresses: Vec<&str> = cc.iter().map(AsRef::as_ref).collect();
    serde_json::to_string(&addresses)
        .map(Some)
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn optional_name(name: &Option<SubscriberName>) -> Option<&str> {
    name.as_ref().map(|name| name.as_ref())
}

fn conflict_on_unique_violation(error: sqlx::Error, email: &SubscriberEmail) -> StoreError {
    match &error {
        sqlx::Error::Database(e) if e.is_unique_violation() => {
            StoreError::Conflict(format!("{} is already subscribed", email))
        }
        _ => {
            tracing::error!("Failed to execute query: {:?}", error);
            StoreError::Database(error)
        }
    }
}

#[async_trait]
impl NewsletterStore for PostgresStore {
    #[tracing::instrument(
        name = "Saving a new newsletter",
        skip(self, newsletter),
        fields(newsletter_id = %newsletter.id)
    )]
    async fn insert_newsletter(&self, newsletter: &Newsletter) -> Result<(), StoreError> {
        let content = &newsletter.content;
        sqlx::query(
            r#"
            INSERT INTO newsletters (
                id, title, subject, html_body, text_body, font, cc_addresses,
                status, created_at, sent_at, scheduled_at, attempts, audience
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(newsletter.id)
        .bind(&content.title)
        .bind(&content.subject)
        .bind(&content.html_body)
        .bind(&content.text_body)
        .bind(content.font.as_ref())
        .bind(serialize_cc(&content.cc)?)
        .bind(newsletter.status.as_str())
        .bind(newsletter.created_at)
        .bind(newsletter.sent_at)
        .bind(newsletter.scheduled_at)
        .bind(newsletter.attempts)
        .bind(&newsletter.audience)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            tracing::error!("Failed to execute query: {:?}", error);
            error
        })?;

        Ok(())
    }

    async fn newsletter(&self, id: Uuid) -> Result<Option<Newsletter>, StoreError> {
        sqlx::query_as::<_, NewsletterRow>("SELECT * FROM newsletters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Newsletter::try_from)
            .transpose()
    }

    async fn newsletters(&self) -> Result<Vec<Newsletter>, StoreError> {
        let rows = sqlx::query_as::<_, NewsletterRow>(
            "SELECT * FROM newsletters ORDER BY created_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        newsletters_from_rows(rows)
    }

    #[tracing::instrument(name = "Updating a draft newsletter", skip(self, content))]
    async fn update_draft(
        &self,
        id: Uuid,
        content: &NewsletterContent,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET title = $2, subject = $3, html_body = $4, text_body = $5, font = $6, cc_addresses = $7
            WHERE id = $1 AND status = 'draft'
            "#,
        )
        .bind(id)
        .bind(&content.title)
        .bind(&content.subject)
        .bind(&content.html_body)
        .bind(&content.text_body)
        .bind(content.font.as_ref())
        .bind(serialize_cc(&content.cc)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Deleting a newsletter", skip(self))]
    async fn delete_newsletter(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM newsletters WHERE id = $1 AND status <> 'sending'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Scheduling a newsletter", skip(self))]
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        from: &[NewsletterStatus],
    ) -> Result<bool, StoreError> {
        let from: Vec<&str> = from.iter().map(NewsletterStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET status = 'scheduled', scheduled_at = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Unscheduling a newsletter", skip(self))]
    async fn unschedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET status = 'draft', scheduled_at = NULL
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Selecting due newsletters", skip(self))]
    async fn due_newsletters(&self) -> Result<Vec<Newsletter>, StoreError> {
        let rows = sqlx::query_as::<_, NewsletterRow>(
            r#"
            SELECT * FROM newsletters
            WHERE status = 'scheduled' AND scheduled_at <= now()
            ORDER BY scheduled_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        newsletters_from_rows(rows)
    }

    async fn failed_newsletters(&self, max_attempts: i32) -> Result<Vec<Newsletter>, StoreError> {
        let rows = sqlx::query_as::<_, NewsletterRow>(
            r#"
            SELECT * FROM newsletters
            WHERE status = 'error' AND attempts < $1
            ORDER BY created_at, id
            "#,
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;
        newsletters_from_rows(rows)
    }

    #[tracing::instrument(name = "Claiming a newsletter for dispatch", skip(self, audience))]
    async fn claim(
        &self,
        id: Uuid,
        observed: NewsletterStatus,
        audience: Option<&[Uuid]>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET status = 'sending', attempts = attempts + 1, audience = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(observed.as_str())
        .bind(audience.map(<[Uuid]>::to_vec))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Releasing a newsletter", skip(self))]
    async fn release(&self, id: Uuid, status: NewsletterStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE newsletters SET status = $2 WHERE id = $1 AND status = 'sending'")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let (active_recipients, total_recipients, sent_newsletters) =
            sqlx::query_as::<_, (i64, i64, i64)>(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM recipients WHERE status = 'active'),
                    (SELECT COUNT(*) FROM recipients),
                    (SELECT COUNT(*) FROM newsletters WHERE status = 'sent')
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let last_sent = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"
            SELECT title, sent_at FROM newsletters
            WHERE status = 'sent' AND sent_at IS NOT NULL
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|(title, sent_at)| LastSent { title, sent_at });

        Ok(Statistics {
            active_recipients,
            total_recipients,
            sent_newsletters,
            last_sent,
        })
    }
}

#[async_trait]
impl RecipientStore for PostgresStore {
    #[tracing::instrument(
        name = "Saving a new subscriber",
        skip(self, recipient),
        fields(email = %recipient.email)
    )]
    async fn insert_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recipients (id, email, first_name, last_name, status, subscribed_at, unsubscribe_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(recipient.id)
        .bind(recipient.email.as_ref())
        .bind(optional_name(&recipient.first_name))
        .bind(optional_name(&recipient.last_name))
        .bind(recipient.status.as_str())
        .bind(recipient.subscribed_at)
        .bind(recipient.unsubscribe_token.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique_violation(e, &recipient.email))?;

        Ok(())
    }

    #[tracing::instrument(
        name = "Importing a subscriber",
        skip(self, recipient),
        fields(email = %recipient.email)
    )]
    async fn insert_recipient_if_absent(&self, recipient: &Recipient) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO recipients (id, email, first_name, last_name, status, subscribed_at, unsubscribe_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(recipient.id)
        .bind(recipient.email.as_ref())
        .bind(optional_name(&recipient.first_name))
        .bind(optional_name(&recipient.last_name))
        .bind(recipient.status.as_str())
        .bind(recipient.subscribed_at)
        .bind(recipient.unsubscribe_token.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError> {
        sqlx::query_as::<_, RecipientRow>("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Recipient::try_from)
            .transpose()
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            "SELECT * FROM recipients ORDER BY subscribed_at DESC, email",
        )
        .fetch_all(&self.pool)
        .await?;
        recipients_from_rows(rows)
    }

    #[tracing::instrument(name = "Get active subscribers", skip(self))]
    async fn active_recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            "SELECT * FROM recipients WHERE status = 'active' ORDER BY email",
        )
        .fetch_all(&self.pool)
        .await?;
        recipients_from_rows(rows)
    }

    #[tracing::instrument(name = "Get selected active subscribers", skip(self, ids))]
    async fn active_recipients_among(&self, ids: &[Uuid]) -> Result<Vec<Recipient>, StoreError> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            "SELECT * FROM recipients WHERE status = 'active' AND id = ANY($1) ORDER BY email",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        recipients_from_rows(rows)
    }

    #[tracing::instrument(
        name = "Updating a subscriber",
        skip(self, recipient),
        fields(subscriber_id = %recipient.id)
    )]
    async fn update_recipient(&self, recipient: &Recipient) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recipients
            SET email = $2, first_name = $3, last_name = $4, status = $5
            WHERE id = $1
            "#,
        )
        .bind(recipient.id)
        .bind(recipient.email.as_ref())
        .bind(optional_name(&recipient.first_name))
        .bind(optional_name(&recipient.last_name))
        .bind(recipient.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique_violation(e, &recipient.email))?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Deleting a subscriber", skip(self))]
    async fn delete_recipient(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM recipients WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Mark subscriber as unsubscribed", skip(self, token))]
    async fn unsubscribe(&self, token: &str) -> Result<Option<Recipient>, StoreError> {
        sqlx::query_as::<_, RecipientRow>(
            r#"
            UPDATE recipients SET status = 'unsubscribed'
            WHERE unsubscribe_token = $1
            RETURNING *
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .map(Recipient::try_from)
        .transpose()
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    #[tracing::instrument(name = "Recording pending deliveries", skip(self, recipient_ids))]
    async fn record_pending(
        &self,
        newsletter_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (newsletter_id, recipient_id, status, recorded_at)
            SELECT $1, t.recipient_id, 'pending', $3
            FROM UNNEST($2::uuid[]) AS t(recipient_id)
            JOIN recipients r ON r.id = t.recipient_id
            ON CONFLICT (newsletter_id, recipient_id)
            DO UPDATE SET status = EXCLUDED.status, recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(newsletter_id)
        .bind(recipient_ids.to_vec())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Storing delivery outcomes", skip(self, outcomes))]
    async fn finish_dispatch(
        &self,
        newsletter_id: Uuid,
        outcomes: &[(Uuid, DeliveryStatus)],
        status: NewsletterStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (recipient_ids, statuses): (Vec<Uuid>, Vec<&str>) = outcomes
            .iter()
            .map(|(id, outcome)| (*id, outcome.as_str()))
            .unzip();

        let mut transaction = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO delivery_records (newsletter_id, recipient_id, status, recorded_at)
            SELECT $1, t.recipient_id, t.status, $4
            FROM UNNEST($2::uuid[], $3::text[]) AS t(recipient_id, status)
            JOIN recipients r ON r.id = t.recipient_id
            ON CONFLICT (newsletter_id, recipient_id)
            DO UPDATE SET status = EXCLUDED.status, recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(newsletter_id)
        .bind(recipient_ids)
        .bind(statuses)
        .bind(sent_at)
        .execute(&mut *transaction)
        .await?;
        sqlx::query("UPDATE newsletters SET status = $2, sent_at = $3 WHERE id = $1")
            .bind(newsletter_id)
            .bind(status.as_str())
            .bind(sent_at)
            .execute(&mut *transaction)
            .await?;
        transaction.commit().await?;

        Ok(())
    }

    async fn deliveries(&self, newsletter_id: Uuid) -> Result<Vec<DeliveryRecord>, StoreError> {
        sqlx::query_as::<_, DeliveryRow>(
            "SELECT * FROM delivery_records WHERE newsletter_id = $1 ORDER BY recorded_at, recipient_id",
        )
        .bind(newsletter_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(DeliveryRecord {
                newsletter_id: row.newsletter_id,
                recipient_id: row.recipient_id,
                status: DeliveryStatus::try_from(row.status.as_str())
                    .map_err(StoreError::Corrupt)?,
                recorded_at: row.recorded_at,
            })
        })
        .collect()
    }
}
