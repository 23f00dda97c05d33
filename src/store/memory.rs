use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    DeliveryRecord, DeliveryStatus, Newsletter, NewsletterContent, NewsletterStatus, Recipient,
    RecipientStatus, SubscriberEmail,
};
use crate::store::{
    DeliveryStore, LastSent, NewsletterStore, RecipientStore, Statistics, StoreError,
};

/// Process-local store with the same contract as [`PostgresStore`](super::PostgresStore).
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    newsletters: HashMap<Uuid, Newsletter>,
    recipients: HashMap<Uuid, Recipient>,
    deliveries: BTreeMap<(Uuid, Uuid), DeliveryRecord>,
}

impl State {
    fn email_taken(&self, email: &SubscriberEmail, except: Option<Uuid>) -> bool {
        self.recipients
            .values()
            .any(|r| &r.email == email && Some(r.id) != except)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Unavailable)
    }
}

fn sorted_by_email(mut recipients: Vec<Recipient>) -> Vec<Recipient> {
    recipients.sort_by(|a, b| a.email.as_ref().cmp(b.email.as_ref()));
    recipients
}

#[async_trait]
impl NewsletterStore for InMemoryStore {
    async fn insert_newsletter(&self, newsletter: &Newsletter) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.newsletters.contains_key(&newsletter.id) {
            return Err(StoreError::Conflict(format!(
                "Newsletter {} already exists",
                newsletter.id
            )));
        }
        state.newsletters.insert(newsletter.id, newsletter.clone());
        Ok(())
    }

    async fn newsletter(&self, id: Uuid) -> Result<Option<Newsletter>, StoreError> {
        Ok(self.state()?.newsletters.get(&id).cloned())
    }

    async fn newsletters(&self) -> Result<Vec<Newsletter>, StoreError> {
        let mut newsletters: Vec<_> = self.state()?.newsletters.values().cloned().collect();
        newsletters.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(newsletters)
    }

    async fn update_draft(
        &self,
        id: Uuid,
        content: &NewsletterContent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.newsletters.get_mut(&id) {
            Some(newsletter) if newsletter.status == NewsletterStatus::Draft => {
                newsletter.content = content.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_newsletter(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.newsletters.get(&id) {
            Some(newsletter) if newsletter.status != NewsletterStatus::Sending => {
                state.newsletters.remove(&id);
                state.deliveries.retain(|(newsletter_id, _), _| *newsletter_id != id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        from: &[NewsletterStatus],
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.newsletters.get_mut(&id) {
            Some(newsletter) if from.contains(&newsletter.status) => {
                newsletter.status = NewsletterStatus::Scheduled;
                newsletter.scheduled_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unschedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.newsletters.get_mut(&id) {
            Some(newsletter) if newsletter.status == NewsletterStatus::Scheduled => {
                newsletter.status = NewsletterStatus::Draft;
                newsletter.scheduled_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn due_newsletters(&self) -> Result<Vec<Newsletter>, StoreError> {
        let now = Utc::now();
        let mut due: Vec<_> = self
            .state()?
            .newsletters
            .values()
            .filter(|n| n.status == NewsletterStatus::Scheduled)
            .filter(|n| n.scheduled_at.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn failed_newsletters(&self, max_attempts: i32) -> Result<Vec<Newsletter>, StoreError> {
        let mut failed: Vec<_> = self
            .state()?
            .newsletters
            .values()
            .filter(|n| n.status == NewsletterStatus::Error && n.attempts < max_attempts)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(failed)
    }

    async fn claim(
        &self,
        id: Uuid,
        observed: NewsletterStatus,
        audience: Option<&[Uuid]>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        match state.newsletters.get_mut(&id) {
            Some(newsletter) if newsletter.status == observed => {
                newsletter.status = NewsletterStatus::Sending;
                newsletter.attempts += 1;
                newsletter.audience = audience.map(<[Uuid]>::to_vec);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: Uuid, status: NewsletterStatus) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(newsletter) = state.newsletters.get_mut(&id) {
            if newsletter.status == NewsletterStatus::Sending {
                newsletter.status = status;
            }
        }
        Ok(())
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let state = self.state()?;
        let active_recipients = state.recipients.values().filter(|r| r.is_active()).count();
        let sent: Vec<_> = state
            .newsletters
            .values()
            .filter(|n| n.status == NewsletterStatus::Sent)
            .collect();
        let last_sent = sent
            .iter()
            .filter_map(|n| n.sent_at.map(|at| (at, n)))
            .max_by_key(|(at, _)| *at)
            .map(|(sent_at, n)| LastSent {
                title: n.content.title.clone(),
                sent_at,
            });

        Ok(Statistics {
            active_recipients: active_recipients as i64,
            total_recipients: state.recipients.len() as i64,
            sent_newsletters: sent.len() as i64,
            last_sent,
        })
    }
}

#[async_trait]
impl RecipientStore for InMemoryStore {
    async fn insert_recipient(&self, recipient: &Recipient) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.email_taken(&recipient.email, None) {
            return Err(StoreError::Conflict(format!(
                "{} is already subscribed",
                recipient.email
            )));
        }
        state.recipients.insert(recipient.id, recipient.clone());
        Ok(())
    }

    async fn insert_recipient_if_absent(&self, recipient: &Recipient) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if state.email_taken(&recipient.email, None) {
            return Ok(false);
        }
        state.recipients.insert(recipient.id, recipient.clone());
        Ok(true)
    }

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>, StoreError> {
        Ok(self.state()?.recipients.get(&id).cloned())
    }

    async fn recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let mut recipients: Vec<_> = self.state()?.recipients.values().cloned().collect();
        recipients.sort_by(|a, b| {
            b.subscribed_at
                .cmp(&a.subscribed_at)
                .then(a.email.as_ref().cmp(b.email.as_ref()))
        });
        Ok(recipients)
    }

    async fn active_recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let active = self
            .state()?
            .recipients
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        Ok(sorted_by_email(active))
    }

    async fn active_recipients_among(&self, ids: &[Uuid]) -> Result<Vec<Recipient>, StoreError> {
        let state = self.state()?;
        let selected: Vec<Recipient> = ids
            .iter()
            .filter_map(|id| state.recipients.get(id))
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        let mut selected = sorted_by_email(selected);
        selected.dedup_by_key(|r| r.id);
        Ok(selected)
    }

    async fn update_recipient(&self, recipient: &Recipient) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if !state.recipients.contains_key(&recipient.id) {
            return Ok(false);
        }
        if state.email_taken(&recipient.email, Some(recipient.id)) {
            return Err(StoreError::Conflict(format!(
                "{} is already subscribed",
                recipient.email
            )));
        }
        state.recipients.insert(recipient.id, recipient.clone());
        Ok(true)
    }

    async fn delete_recipient(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let removed = state.recipients.remove(&id).is_some();
        state.deliveries.retain(|(_, recipient_id), _| *recipient_id != id);
        Ok(removed)
    }

    async fn unsubscribe(&self, token: &str) -> Result<Option<Recipient>, StoreError> {
        let mut state = self.state()?;
        let recipient = state
            .recipients
            .values_mut()
            .find(|r| r.unsubscribe_token.as_ref() == token);
        Ok(recipient.map(|r| {
            r.status = RecipientStatus::Unsubscribed;
            r.clone()
        }))
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn record_pending(
        &self,
        newsletter_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let now = Utc::now();
        for recipient_id in recipient_ids {
            if !state.recipients.contains_key(recipient_id) {
                continue;
            }
            state.deliveries.insert(
                (newsletter_id, *recipient_id),
                DeliveryRecord {
                    newsletter_id,
                    recipient_id: *recipient_id,
                    status: DeliveryStatus::Pending,
                    recorded_at: now,
                },
            );
        }
        Ok(())
    }

    async fn finish_dispatch(
        &self,
        newsletter_id: Uuid,
        outcomes: &[(Uuid, DeliveryStatus)],
        status: NewsletterStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let newsletter = state
            .newsletters
            .get_mut(&newsletter_id)
            .ok_or_else(|| StoreError::Corrupt(format!("Newsletter {} vanished", newsletter_id)))?;
        newsletter.status = status;
        newsletter.sent_at = Some(sent_at);

        for (recipient_id, outcome) in outcomes {
            if !state.recipients.contains_key(recipient_id) {
                continue;
            }
            state.deliveries.insert(
                (newsletter_id, *recipient_id),
                DeliveryRecord {
                    newsletter_id,
                    recipient_id: *recipient_id,
                    status: *outcome,
                    recorded_at: sent_at,
                },
            );
        }
        Ok(())
    }

    async fn deliveries(&self, newsletter_id: Uuid) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state()?
            .deliveries
            .values()
            .filter(|r| r.newsletter_id == newsletter_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then(a.recipient_id.cmp(&b.recipient_id))
        });
        Ok(records)
    }
}
