//! Authenticated sessions over a mail relay.
//!
//! A [`DeliveryChannel`] opens a [`ChannelSession`] (connect and authenticate);
//! the session sends composed messages until it is closed.

mod http;
mod smtp;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::SubscriberEmail;
use crate::utils::error_chain_fmt;

pub use http::HttpRelay;
pub use smtp::SmtpRelay;

/// One composed message, ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub sender: SubscriberEmail,
    pub sender_name: Option<String>,
    pub to: Vec<SubscriberEmail>,
    pub cc: Vec<SubscriberEmail>,
    pub bcc: Vec<SubscriberEmail>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl OutgoingMessage {
    /// Every address the relay must deliver to.
    pub fn envelope_recipients(&self) -> impl Iterator<Item = &SubscriberEmail> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }
}

#[derive(thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to the relay")]
    Connect(#[source] anyhow::Error),
    #[error("The relay rejected our credentials")]
    Auth(#[source] anyhow::Error),
    #[error("The relay refused the message")]
    Send(#[source] anyhow::Error),
    #[error("The relay did not answer within {0:?}")]
    Timeout(Duration),
    #[error("The message could not be built: {0}")]
    InvalidMessage(String),
}

impl Debug for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ChannelSession>, ChannelError>;
}

#[async_trait]
pub trait ChannelSession: Send {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), ChannelError>;

    /// Best effort; callers log and ignore failures.
    async fn close(self: Box<Self>) -> Result<(), ChannelError>;
}
