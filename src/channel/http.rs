use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;

use crate::channel::{ChannelError, ChannelSession, DeliveryChannel, OutgoingMessage};
use crate::configuration::RelaySettings;
use crate::domain::SubscriberEmail;

/// Postmark-style HTTP email API.
#[derive(Clone)]
pub struct HttpRelay {
    http_client: Client,
    base_url: String,
    authorization_token: Secret<String>,
    timeout: std::time::Duration,
}

impl HttpRelay {
    pub fn new(settings: &RelaySettings) -> Result<Self, ChannelError> {
        let timeout = settings.timeout();
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Connect(e.into()))?;

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            authorization_token: settings.password.clone(),
            timeout,
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> ChannelError {
        if error.is_timeout() {
            ChannelError::Timeout(self.timeout)
        } else {
            ChannelError::Connect(error.into())
        }
    }
}

#[async_trait]
impl DeliveryChannel for HttpRelay {
    /// Asks the relay about our server so bad tokens surface before any send.
    #[tracing::instrument(name = "Opening an HTTP relay session", skip(self))]
    async fn open(&self) -> Result<Box<dyn ChannelSession>, ChannelError> {
        let response = self
            .http_client
            .get(format!("{}/server", self.base_url))
            .header(
                "X-Postmark-Server-Token",
                self.authorization_token.expose_secret(),
            )
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChannelError::Auth(
                anyhow::anyhow!("The relay answered {}", response.status()),
            )),
            status if !status.is_success() => Err(ChannelError::Connect(anyhow::anyhow!(
                "The relay answered {}",
                status
            ))),
            _ => Ok(Box::new(HttpSession {
                relay: self.clone(),
            })),
        }
    }
}

struct HttpSession {
    relay: HttpRelay,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: String,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bcc: Option<String>,
    subject: &'a str,
    html_body: &'a str,
    text_body: &'a str,
}

fn address_list(addresses: &[SubscriberEmail]) -> Option<String> {
    if addresses.is_empty() {
        return None;
    }
    let joined: Vec<&str> = addresses.iter().map(AsRef::as_ref).collect();
    Some(joined.join(", "))
}

impl<'a> From<&'a OutgoingMessage> for SendEmailRequest<'a> {
    fn from(message: &'a OutgoingMessage) -> Self {
        let from = match &message.sender_name {
            Some(name) => format!("{} <{}>", name, message.sender),
            None => message.sender.to_string(),
        };

        Self {
            from,
            to: address_list(&message.to).unwrap_or_default(),
            cc: address_list(&message.cc),
            bcc: address_list(&message.bcc),
            subject: &message.subject,
            html_body: &message.html,
            text_body: &message.text,
        }
    }
}

#[async_trait]
impl ChannelSession for HttpSession {
    #[tracing::instrument(name = "Posting an email to the HTTP relay", skip(self, message))]
    async fn send(&mut self, message: &OutgoingMessage) -> Result<(), ChannelError> {
        if message.to.is_empty() {
            return Err(ChannelError::InvalidMessage(
                "A message needs at least one primary addressee".to_string(),
            ));
        }
        let url = format!("{}/email", self.relay.base_url);
        let request_body = SendEmailRequest::from(message);

        let response = self
            .relay
            .http_client
            .post(&url)
            .header(
                "X-Postmark-Server-Token",
                self.relay.authorization_token.expose_secret(),
            )
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout(self.relay.timeout)
                } else {
                    ChannelError::Send(e.into())
                }
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChannelError::Auth(
                anyhow::anyhow!("The relay answered {}", response.status()),
            )),
            _ => {
                response
                    .error_for_status()
                    .map_err(|e| ChannelError::Send(e.into()))?;
                Ok(())
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}
