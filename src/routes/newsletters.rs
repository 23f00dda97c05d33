use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatcher::{Audience, DispatchReport, Dispatcher, Trigger};
use crate::domain::{
    DeliveryRecord, Newsletter, NewsletterContent, NewsletterStatus, SubscriberEmail,
};
use crate::routes::{missing_or_conflict, newsletter_not_found, ApiError};
use crate::store::Store;

#[derive(Deserialize)]
pub struct NewsletterBody {
    title: String,
    subject: Option<String>,
    html_body: String,
    text_body: Option<String>,
    font: Option<String>,
    #[serde(default)]
    cc: Vec<String>,
    scheduled_at: Option<DateTime<Utc>>,
}

impl TryFrom<NewsletterBody> for NewsletterContent {
    type Error = ApiError;

    fn try_from(body: NewsletterBody) -> Result<Self, Self::Error> {
        NewsletterContent::parse(
            body.title,
            body.subject,
            body.html_body,
            body.text_body,
            body.font,
            body.cc,
        )
        .map_err(ApiError::ValidationError)
    }
}

async fn load(store: &Arc<dyn Store>, id: Uuid) -> Result<Newsletter, ApiError> {
    store
        .newsletter(id)
        .await?
        .ok_or_else(|| newsletter_not_found(id))
}

#[tracing::instrument(name = "Listing newsletters", skip(store))]
pub async fn list_newsletters(
    State(store): State<Arc<dyn Store>>,
) -> Result<Json<Vec<Newsletter>>, ApiError> {
    Ok(Json(store.newsletters().await?))
}

#[tracing::instrument(
    name = "Creating a newsletter",
    skip(store, body),
    fields(title = %body.title, newsletter_id = tracing::field::Empty)
)]
pub async fn create_newsletter(
    State(store): State<Arc<dyn Store>>,
    Json(body): Json<NewsletterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduled_at = body.scheduled_at;
    let newsletter = Newsletter::draft(body.try_into()?);
    tracing::Span::current().record("newsletter_id", &tracing::field::display(&newsletter.id));
    store.insert_newsletter(&newsletter).await?;

    if let Some(at) = scheduled_at {
        store
            .reschedule(newsletter.id, at, &[NewsletterStatus::Draft])
            .await?;
    }

    Ok((StatusCode::CREATED, Json(load(&store, newsletter.id).await?)))
}

pub async fn get_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Newsletter>, ApiError> {
    Ok(Json(load(&store, id).await?))
}

#[tracing::instrument(name = "Editing a newsletter", skip(store, body))]
pub async fn edit_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
    Json(body): Json<NewsletterBody>,
) -> Result<Json<Newsletter>, ApiError> {
    let content: NewsletterContent = body.try_into()?;
    if !store.update_draft(id, &content).await? {
        return Err(missing_or_conflict(&store, id, "Only drafts can be edited").await?);
    }
    Ok(Json(load(&store, id).await?))
}

#[tracing::instrument(name = "Deleting a newsletter", skip(store))]
pub async fn delete_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !store.delete_newsletter(id).await? {
        return Err(missing_or_conflict(&store, id, "The newsletter is being sent").await?);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(name = "Duplicating a newsletter", skip(store))]
pub async fn duplicate_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let copy = load(&store, id).await?.duplicate();
    store.insert_newsletter(&copy).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

pub async fn preview_newsletter(
    State(dispatcher): State<Dispatcher>,
    Path(id): Path<Uuid>,
) -> Result<Html<String>, ApiError> {
    let newsletter = load(dispatcher.store(), id).await?;
    Ok(Html(dispatcher.composer().render_html(&newsletter)))
}

#[derive(Deserialize)]
pub struct ScheduleBody {
    scheduled_at: DateTime<Utc>,
}

#[tracing::instrument(
    name = "Scheduling a newsletter",
    skip(store, body),
    fields(scheduled_at = %body.scheduled_at)
)]
pub async fn schedule_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<Newsletter>, ApiError> {
    let from = [NewsletterStatus::Draft, NewsletterStatus::Scheduled];
    if !store.reschedule(id, body.scheduled_at, &from).await? {
        return Err(missing_or_conflict(
            &store,
            id,
            "Only drafts or scheduled newsletters can be scheduled",
        )
        .await?);
    }
    Ok(Json(load(&store, id).await?))
}

#[tracing::instrument(name = "Unscheduling a newsletter", skip(store))]
pub async fn unschedule_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Newsletter>, ApiError> {
    if !store.unschedule(id).await? {
        return Err(missing_or_conflict(&store, id, "The newsletter is not scheduled").await?);
    }
    Ok(Json(load(&store, id).await?))
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
pub enum RecipientSelection {
    #[default]
    #[serde(skip)]
    All,
    Keyword(String),
    Ids(Vec<Uuid>),
}

#[derive(Deserialize, Default)]
pub struct SendBody {
    #[serde(default)]
    recipients: RecipientSelection,
}

impl TryFrom<RecipientSelection> for Audience {
    type Error = ApiError;

    fn try_from(selection: RecipientSelection) -> Result<Self, Self::Error> {
        match selection {
            RecipientSelection::All => Ok(Audience::AllActive),
            RecipientSelection::Keyword(keyword) if keyword == "all" => Ok(Audience::AllActive),
            RecipientSelection::Keyword(other) => Err(ApiError::ValidationError(format!(
                "{} is neither \"all\" nor a list of subscriber ids",
                other
            ))),
            RecipientSelection::Ids(ids) => Ok(Audience::Selected(ids)),
        }
    }
}

#[tracing::instrument(name = "Sending a newsletter", skip(dispatcher, body))]
pub async fn send_newsletter(
    State(dispatcher): State<Dispatcher>,
    Path(id): Path<Uuid>,
    body: Option<Json<SendBody>>,
) -> Result<Json<DispatchReport>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let audience = body.recipients.try_into()?;
    let report = dispatcher
        .dispatch(id, audience, Trigger::Interactive)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct TestBody {
    email: String,
}

#[tracing::instrument(
    name = "Sending a test newsletter",
    skip(dispatcher, body),
    fields(email = %body.email)
)]
pub async fn send_test_newsletter(
    State(dispatcher): State<Dispatcher>,
    Path(id): Path<Uuid>,
    Json(body): Json<TestBody>,
) -> Result<Json<DispatchReport>, ApiError> {
    let address = SubscriberEmail::parse(body.email).map_err(ApiError::ValidationError)?;
    Ok(Json(dispatcher.send_test(id, &address).await?))
}

#[derive(Deserialize, Default)]
pub struct RequeueBody {
    scheduled_at: Option<DateTime<Utc>>,
}

#[tracing::instrument(name = "Requeuing a newsletter", skip(store, body))]
pub async fn requeue_newsletter(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
    body: Option<Json<RequeueBody>>,
) -> Result<Json<Newsletter>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let at = body.scheduled_at.unwrap_or_else(Utc::now);
    let from = [NewsletterStatus::Error, NewsletterStatus::PartiallySent];
    if !store.reschedule(id, at, &from).await? {
        return Err(missing_or_conflict(
            &store,
            id,
            "Only failed or partially sent newsletters can be requeued",
        )
        .await?);
    }
    Ok(Json(load(&store, id).await?))
}

pub async fn list_deliveries(
    State(store): State<Arc<dyn Store>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    load(&store, id).await?;
    Ok(Json(store.deliveries(id).await?))
}
