use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::domain::SubscriberEmail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsletterStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    PartiallySent,
    Error,
}

impl NewsletterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsletterStatus::Draft => "draft",
            NewsletterStatus::Scheduled => "scheduled",
            NewsletterStatus::Sending => "sending",
            NewsletterStatus::Sent => "sent",
            NewsletterStatus::PartiallySent => "partially_sent",
            NewsletterStatus::Error => "error",
        }
    }

    /// Terminal status of a dispatch given how many recipients were reached.
    pub fn from_outcomes(sent: usize, failed: usize) -> Self {
        match (sent, failed) {
            (_, 0) => NewsletterStatus::Sent,
            (0, _) => NewsletterStatus::Error,
            _ => NewsletterStatus::PartiallySent,
        }
    }
}

impl Display for NewsletterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for NewsletterStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "partially_sent" => Ok(Self::PartiallySent),
            "error" => Ok(NewsletterStatus::Error),
            other => Err(format!("{} is not a newsletter status", other)),
        }
    }
}

/// CSS font family the HTML body is wrapped in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FontFamily(String);

impl FontFamily {
    pub fn parse(s: String) -> Result<Self, String> {
        let trimmed = s.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed.len() <= 50
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'));

        match is_valid {
            true => Ok(Self(trimmed.to_string())),
            false => Err(format!("{} is not a valid font family", s)),
        }
    }
}

impl Default for FontFamily {
    fn default() -> Self {
        Self("Arial".to_string())
    }
}

impl AsRef<str> for FontFamily {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything the author controls on a newsletter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewsletterContent {
    pub title: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub font: FontFamily,
    pub cc: Vec<SubscriberEmail>,
}

impl NewsletterContent {
    pub fn parse(
        title: String,
        subject: Option<String>,
        html_body: String,
        text_body: Option<String>,
        font: Option<String>,
        cc: Vec<String>,
    ) -> Result<Self, String> {
        let title = parse_heading(title, "title")?;
        let subject = match subject {
            Some(subject) if !subject.trim().is_empty() => parse_heading(subject, "subject")?,
            _ => title.clone(),
        };

        if html_body.trim().is_empty() {
            return Err("The HTML body of a newsletter cannot be empty".to_string());
        }
        let text_body = match text_body {
            Some(text) if !text.trim().is_empty() => text,
            _ => strip_tags(&html_body),
        };

        let font = match font {
            Some(font) => FontFamily::parse(font)?,
            None => FontFamily::default(),
        };
        let cc = cc
            .into_iter()
            .map(SubscriberEmail::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            title,
            subject,
            html_body,
            text_body,
            font,
            cc,
        })
    }
}

fn parse_heading(s: String, field: &str) -> Result<String, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(format!("The newsletter {} cannot be empty", field));
    }
    if trimmed.graphemes(true).count() > 200 {
        return Err(format!("The newsletter {} is longer than 200 characters", field));
    }
    Ok(trimmed.to_string())
}

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "blockquote", "br", "div", "footer", "h1", "h2", "h3", "h4", "h5",
    "h6", "header", "hr", "li", "ol", "p", "section", "table", "td", "th", "tr", "ul",
];

fn is_block_tag(tag: &str) -> bool {
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    BLOCK_TAGS.contains(&name.as_str())
}

/// Plain text of an HTML body, with a line break wherever a block element
/// starts or ends.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag: Option<String> = None;
    for c in html.chars() {
        if let Some(name) = tag.as_mut() {
            if c == '>' {
                if is_block_tag(name) && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                tag = None;
            } else {
                name.push(c);
            }
        } else if c == '<' {
            tag = Some(String::new());
        } else {
            out.push(c);
        }
    }
    out.trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Newsletter {
    pub id: Uuid,
    #[serde(flatten)]
    pub content: NewsletterContent,
    pub status: NewsletterStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    /// Recipient ids the last dispatch was aimed at; `None` means every active
    /// recipient.
    pub audience: Option<Vec<Uuid>>,
}

impl Newsletter {
    pub fn draft(content: NewsletterContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            status: NewsletterStatus::Draft,
            created_at: Utc::now(),
            sent_at: None,
            scheduled_at: None,
            attempts: 0,
            audience: None,
        }
    }

    /// A fresh draft carrying the same content.
    pub fn duplicate(&self) -> Self {
        let mut content = self.content.clone();
        content.title = format!("Copy of {}", content.title);
        Self::draft(content)
    }
}
