use std::borrow::Cow;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Recipient, RecipientStatus, SubscriberEmail, SubscriberName};
use crate::routes::ApiError;
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct SubscriberBody {
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: Option<RecipientStatus>,
}

struct ValidSubscriber {
    email: SubscriberEmail,
    first_name: Option<SubscriberName>,
    last_name: Option<SubscriberName>,
    status: Option<RecipientStatus>,
}

impl TryFrom<SubscriberBody> for ValidSubscriber {
    type Error = ApiError;

    fn try_from(body: SubscriberBody) -> Result<Self, Self::Error> {
        Ok(Self {
            email: SubscriberEmail::parse(body.email).map_err(ApiError::ValidationError)?,
            first_name: SubscriberName::parse_optional(body.first_name)
                .map_err(ApiError::ValidationError)?,
            last_name: SubscriberName::parse_optional(body.last_name)
                .map_err(ApiError::ValidationError)?,
            status: body.status,
        })
    }
}

fn subscriber_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Subscriber {} does not exist", id))
}

#[tracing::instrument(name = "Listing subscribers", skip(store))]
pub async fn list_subscribers(
    State(store): State<Arc<dyn Store>>,
) -> Result<Json<Vec<Recipient>>, ApiError> {
    Ok(Json(store.recipients().await?))
}

#[tracing::instrument(
    name = "Adding a new subscriber",
    skip(store, body),
    fields(subscriber_email = %body.email)
)]
pub async fn create_subscriber(
    State(store): State<Arc<dyn Store>>,
    Json(body): Json<SubscriberBody>,
) -> Result<impl IntoResponse, ApiError> {
    let valid: ValidSubscriber = body.try_into()?;
    let mut recipient = Recipient::new(valid.email, valid.first_name, valid.last_name);
    if let Some(status) = valid.status {
        recipient.status = status;
    }
    store.insert_recipient(&recipient).await?;
    Ok((StatusCode::CREATED, Json(recipient)))
}

#[tracing::instrument(
    name = "Editing a subscriber",
    skip(store, body),
    fields(subscriber_email = %body.email)
)]
pub async fn edit_subscriber(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubscriberBody>,
) -> Result<Json<Recipient>, ApiError> {
    let valid: ValidSubscriber = body.try_into()?;
    let mut recipient = store
        .recipient(id)
        .await?
        .ok_or_else(|| subscriber_not_found(id))?;

    recipient.email = valid.email;
    recipient.first_name = valid.first_name;
    recipient.last_name = valid.last_name;
    if let Some(status) = valid.status {
        recipient.status = status;
    }

    if !store.update_recipient(&recipient).await? {
        return Err(subscriber_not_found(id));
    }
    Ok(Json(recipient))
}

#[tracing::instrument(name = "Deleting a subscriber", skip(store))]
pub async fn delete_subscriber(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match store.delete_recipient(id).await? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(subscriber_not_found(id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportParameters {
    #[serde(default = "default_email_column")]
    email_column: String,
    first_name_column: Option<String>,
    last_name_column: Option<String>,
}

fn default_email_column() -> String {
    "email".to_string()
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ImportSummary {
    imported: usize,
    skipped: usize,
    errors: usize,
}

/// Column positions resolved against the CSV header.
#[derive(Debug)]
struct Columns {
    email: usize,
    first_name: Option<usize>,
    last_name: Option<usize>,
}

impl Columns {
    fn resolve(
        headers: &csv::StringRecord,
        parameters: &ImportParameters,
    ) -> Result<Self, ApiError> {
        let position = |name: &str| headers.iter().position(|header| header == name);

        let email = position(parameters.email_column.as_str()).ok_or_else(|| {
            ApiError::ValidationError(format!(
                "Column \"{}\" not found. Available columns: {}",
                parameters.email_column,
                headers.iter().collect::<Vec<_>>().join(", ")
            ))
        })?;

        Ok(Self {
            email,
            first_name: parameters.first_name_column.as_deref().and_then(position),
            last_name: parameters.last_name_column.as_deref().and_then(position),
        })
    }

    fn field(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
        index.and_then(|i| record.get(i)).map(str::to_string)
    }
}

/// UTF-8 with or without a byte order mark, otherwise Windows-1252 as
/// spreadsheet exports often are.
fn decode_csv(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match encoding_rs::UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => text,
        None => {
            tracing::info!("The CSV is not UTF-8, reading it as Windows-1252");
            encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes).0
        }
    }
}

#[tracing::instrument(name = "Importing subscribers", skip(store, body))]
pub async fn import_subscribers(
    State(store): State<Arc<dyn Store>>,
    Query(parameters): Query<ImportParameters>,
    body: Bytes,
) -> Result<Json<ImportSummary>, ApiError> {
    let body = decode_csv(&body);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ApiError::ValidationError(format!("Unreadable CSV header: {}", e)))?
        .clone();
    let columns = Columns::resolve(&headers, &parameters)?;

    let mut summary = ImportSummary::default();
    for (i, record) in reader.records().enumerate() {
        // The header occupies line 1.
        let line = i + 2;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(line, error = %e, "Unreadable CSV row");
                summary.errors += 1;
                continue;
            }
        };

        let email = record.get(columns.email).unwrap_or_default().to_string();
        let email = match SubscriberEmail::parse(email) {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(line, error = %e, "Skipping a row without a valid email");
                summary.errors += 1;
                continue;
            }
        };

        let first_name =
            SubscriberName::parse_optional(Columns::field(&record, columns.first_name));
        let last_name =
            SubscriberName::parse_optional(Columns::field(&record, columns.last_name));
        let (first_name, last_name) = match (first_name, last_name) {
            (Ok(first_name), Ok(last_name)) => (first_name, last_name),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(line, error = %e, "Skipping a row with an invalid name");
                summary.errors += 1;
                continue;
            }
        };

        let recipient = Recipient::new(email, first_name, last_name);
        match store.insert_recipient_if_absent(&recipient).await? {
            true => summary.imported += 1,
            false => summary.skipped += 1,
        }
    }

    tracing::info!(
        imported = summary.imported,
        skipped = summary.skipped,
        errors = summary.errors,
        "Import finished"
    );
    Ok(Json(summary))
}

#[tracing::instrument(name = "Exporting subscribers", skip(store))]
pub async fn export_subscribers(
    State(store): State<Arc<dyn Store>>,
) -> Result<impl IntoResponse, ApiError> {
    let recipients = store.recipients().await?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["email", "first_name", "last_name", "subscribed_at", "status"])
        .context("Failed to write the CSV header")?;
    for recipient in &recipients {
        let subscribed_at = recipient.subscribed_at.to_rfc3339();
        writer
            .write_record([
                recipient.email.as_ref(),
                recipient.first_name.as_ref().map_or("", |name| name.as_ref()),
                recipient.last_name.as_ref().map_or("", |name| name.as_ref()),
                subscribed_at.as_str(),
                recipient.status.as_str(),
            ])
            .context("Failed to write a CSV row")?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush the CSV export")?;

    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                CONTENT_DISPOSITION,
                "attachment; filename=\"subscribers.csv\"",
            ),
        ],
        bytes,
    ))
}
