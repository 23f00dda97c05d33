use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

use crate::channel::{ChannelError, ChannelSession, DeliveryChannel, OutgoingMessage};
use crate::configuration::RelaySettings;
use crate::domain::SubscriberEmail;

/// SMTP relay reached through lettre's pooled tokio transport. Clones share
/// the pool, so the connection `open` verifies is the one later sends reuse.
#[derive(Clone)]
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn new(settings: &RelaySettings) -> Result<Self, ChannelError> {
        let builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| ChannelError::Connect(e.into()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        let mut builder = builder
            .port(settings.port)
            .timeout(Some(settings.timeout()));
        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.expose_secret().clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn classify(error: lettre::transport::smtp::Error) -> ChannelError {
    let rejected_credentials = error
        .status()
        .map_or(false, |code| code.to_string() == "535");
    if rejected_credentials {
        ChannelError::Auth(error.into())
    } else {
        ChannelError::Connect(error.into())
    }
}

#[async_trait]
impl DeliveryChannel for SmtpRelay {
    #[tracing::instrument(name = "Opening an SMTP session", skip(self))]
    async fn open(&self) -> Result<Box<dyn ChannelSession>, ChannelError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(Box::new(SmtpSession {
                transport: self.transport.clone(),
            })),
            Ok(false) => Err(ChannelError::Connect(anyhow::anyhow!(
                "The relay did not accept the connection"
            ))),
            Err(e) => Err(classify(e)),
        }
    }
}

struct SmtpSession {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl ChannelSession for SmtpSession {
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), ChannelError> {
        let message = build_message(message)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| ChannelError::Send(e.into()))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}

fn mailbox(email: &SubscriberEmail, name: Option<&str>) -> Result<Mailbox, ChannelError> {
    let address = email
        .as_ref()
        .parse::<Address>()
        .map_err(|e| ChannelError::InvalidMessage(format!("{}: {}", email, e)))?;
    Ok(Mailbox::new(name.map(str::to_string), address))
}

fn build_message(message: &OutgoingMessage) -> Result<Message, ChannelError> {
    let mut builder = Message::builder()
        .from(mailbox(&message.sender, message.sender_name.as_deref())?)
        .subject(message.subject.as_str());
    for to in &message.to {
        builder = builder.to(mailbox(to, None)?);
    }
    for cc in &message.cc {
        builder = builder.cc(mailbox(cc, None)?);
    }
    for bcc in &message.bcc {
        builder = builder.bcc(mailbox(bcc, None)?);
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            message.text.clone(),
            message.html.clone(),
        ))
        .map_err(|e| ChannelError::InvalidMessage(e.to_string()))
}
