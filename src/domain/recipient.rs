use std::fmt::Display;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{SubscriberEmail, SubscriberName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Active,
    Unsubscribed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Active => "active",
            RecipientStatus::Unsubscribed => "unsubscribed",
        }
    }
}

impl Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RecipientStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "active" => Ok(Self::Active),
            "unsubscribed" => Ok(Self::Unsubscribed),
            other => Err(format!("{} is not a subscription status", other)),
        }
    }
}

const TOKEN_LENGTH: usize = 32;

/// Opaque token embedded in self-service unsubscribe links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UnsubscribeToken(String);

impl UnsubscribeToken {
    pub fn generate() -> Self {
        let mut rng = thread_rng();
        let token = std::iter::repeat_with(|| rng.sample(Alphanumeric))
            .map(char::from)
            .take(TOKEN_LENGTH)
            .collect();
        Self(token)
    }

    pub fn parse(s: String) -> Result<Self, String> {
        match s.len() == TOKEN_LENGTH && s.chars().all(|c| c.is_ascii_alphanumeric()) {
            true => Ok(Self(s)),
            false => Err(format!("{} is not a valid unsubscribe token", s)),
        }
    }
}

impl AsRef<str> for UnsubscribeToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub id: Uuid,
    pub email: SubscriberEmail,
    pub first_name: Option<SubscriberName>,
    pub last_name: Option<SubscriberName>,
    pub status: RecipientStatus,
    pub subscribed_at: DateTime<Utc>,
    pub unsubscribe_token: UnsubscribeToken,
}

impl Recipient {
    pub fn new(
        email: SubscriberEmail,
        first_name: Option<SubscriberName>,
        last_name: Option<SubscriberName>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            first_name,
            last_name,
            status: RecipientStatus::Active,
            subscribed_at: Utc::now(),
            unsubscribe_token: UnsubscribeToken::generate(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RecipientStatus::Active
    }
}
