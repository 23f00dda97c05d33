use uuid::Uuid;

use crate::channel::OutgoingMessage;
use crate::configuration::{DeliveryStrategy, DispatchSettings, RelaySettings};
use crate::domain::{Newsletter, Recipient, SubscriberEmail};

const LOGO_PLACEHOLDER: &str = "{{logo_url}}";

/// One message and the recipients whose outcome it decides.
#[derive(Debug, Clone)]
pub struct Batch {
    pub recipient_ids: Vec<Uuid>,
    pub message: OutgoingMessage,
}

/// Turns a newsletter and its audience into relay-ready messages.
#[derive(Debug, Clone)]
pub struct Composer {
    sender: SubscriberEmail,
    sender_name: Option<String>,
    public_url: String,
    logo_path: String,
    operator_bcc: Option<SubscriberEmail>,
    strategy: DeliveryStrategy,
    batch_size: Option<usize>,
}

impl Composer {
    pub fn new(relay: &RelaySettings, dispatch: &DispatchSettings) -> Result<Self, String> {
        let operator_bcc = match &dispatch.operator_bcc {
            Some(address) if !address.trim().is_empty() => {
                Some(SubscriberEmail::parse(address.clone())?)
            }
            _ => None,
        };

        Ok(Self {
            sender: relay.sender()?,
            sender_name: relay.sender_name.clone().filter(|n| !n.trim().is_empty()),
            public_url: dispatch.public_url.trim_end_matches('/').to_string(),
            logo_path: dispatch.logo_path.clone(),
            operator_bcc,
            strategy: dispatch.strategy,
            batch_size: dispatch.batch_size.filter(|size| *size > 0),
        })
    }

    /// HTML part exactly as recipients receive it, minus any unsubscribe footer.
    pub fn render_html(&self, newsletter: &Newsletter) -> String {
        self.wrap(newsletter, &self.substitute_logo(&newsletter.content.html_body))
    }

    pub fn compose(&self, newsletter: &Newsletter, recipients: &[Recipient]) -> Vec<Batch> {
        match self.strategy {
            DeliveryStrategy::Batched => self.batched(newsletter, recipients),
            DeliveryStrategy::Personalized => self.personalized(newsletter, recipients),
        }
    }

    /// Single ad-hoc address, addressed like a batched send.
    pub fn compose_test(
        &self,
        newsletter: &Newsletter,
        address: &SubscriberEmail,
    ) -> OutgoingMessage {
        let mut bcc = vec![address.clone()];
        bcc.extend(self.operator_bcc.clone());
        self.message(
            newsletter,
            vec![self.sender.clone()],
            bcc,
            newsletter.content.text_body.clone(),
            self.render_html(newsletter),
        )
    }

    fn batched(&self, newsletter: &Newsletter, recipients: &[Recipient]) -> Vec<Batch> {
        let chunk_size = self.batch_size.unwrap_or(recipients.len()).max(1);
        let html = self.render_html(newsletter);

        recipients
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, chunk)| {
                let mut bcc: Vec<_> = chunk.iter().map(|r| r.email.clone()).collect();
                if i == 0 {
                    bcc.extend(self.operator_bcc.clone());
                }
                Batch {
                    recipient_ids: chunk.iter().map(|r| r.id).collect(),
                    message: self.message(
                        newsletter,
                        vec![self.sender.clone()],
                        bcc,
                        newsletter.content.text_body.clone(),
                        html.clone(),
                    ),
                }
            })
            .collect()
    }

    fn personalized(&self, newsletter: &Newsletter, recipients: &[Recipient]) -> Vec<Batch> {
        let body = self.substitute_logo(&newsletter.content.html_body);

        recipients
            .iter()
            .enumerate()
            .map(|(i, recipient)| {
                let link = format!(
                    "{}/unsubscribe/{}",
                    self.public_url,
                    recipient.unsubscribe_token.as_ref()
                );
                let text = format!(
                    "{}\n\nTo stop receiving this newsletter visit {}",
                    newsletter.content.text_body, link
                );
                let html = self.wrap(
                    newsletter,
                    &format!(
                        "{}<p><a href=\"{}\">Unsubscribe</a></p>",
                        body, link
                    ),
                );
                let bcc = if i == 0 {
                    self.operator_bcc.iter().cloned().collect()
                } else {
                    vec![]
                };
                Batch {
                    recipient_ids: vec![recipient.id],
                    message: self.message(
                        newsletter,
                        vec![recipient.email.clone()],
                        bcc,
                        text,
                        html,
                    ),
                }
            })
            .collect()
    }

    fn message(
        &self,
        newsletter: &Newsletter,
        to: Vec<SubscriberEmail>,
        bcc: Vec<SubscriberEmail>,
        text: String,
        html: String,
    ) -> OutgoingMessage {
        OutgoingMessage {
            sender: self.sender.clone(),
            sender_name: self.sender_name.clone(),
            to,
            cc: newsletter.content.cc.clone(),
            bcc,
            subject: newsletter.content.subject.clone(),
            text,
            html,
        }
    }

    fn substitute_logo(&self, html: &str) -> String {
        html.replace(
            LOGO_PLACEHOLDER,
            &format!("{}{}", self.public_url, self.logo_path),
        )
    }

    fn wrap(&self, newsletter: &Newsletter, html: &str) -> String {
        format!(
            "<div style=\"font-family: {}, sans-serif;\">{}</div>",
            newsletter.content.font.as_ref(),
            html
        )
    }
}

#[cfg(test)]
impl Composer {
    pub(crate) fn for_tests(strategy: DeliveryStrategy, batch_size: Option<usize>) -> Self {
        let relay = RelaySettings {
            kind: crate::configuration::RelayKind::Smtp,
            host: "localhost".to_string(),
            port: 25,
            username: String::new(),
            password: secrecy::Secret::new(String::new()),
            sender: "newsletter@example.com".to_string(),
            sender_name: Some("Bulletin".to_string()),
            starttls: false,
            base_url: String::new(),
            timeout_milliseconds: 1000,
        };
        let dispatch = DispatchSettings {
            public_url: "https://news.example.com/".to_string(),
            logo_path: "/static/logo.png".to_string(),
            operator_bcc: Some("operator@example.com".to_string()),
            strategy,
            batch_size,
        };
        Self::new(&relay, &dispatch).unwrap()
    }
}
