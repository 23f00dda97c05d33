mod health_check;
mod newsletters;
mod statistics;
mod subscribers;
mod unsubscribe;

use std::fmt::Debug;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::dispatcher::DispatchError;
use crate::store::{Store, StoreError};
use crate::utils::error_chain_fmt;

pub use health_check::check_health;
pub use newsletters::{
    create_newsletter, delete_newsletter, duplicate_newsletter, edit_newsletter, get_newsletter,
    list_deliveries, list_newsletters, preview_newsletter, requeue_newsletter,
    schedule_newsletter, send_newsletter, send_test_newsletter, unschedule_newsletter,
};
pub use statistics::{check_relay, get_statistics};
pub use subscribers::{
    create_subscriber, delete_subscriber, edit_subscriber, export_subscribers,
    import_subscribers, list_subscribers,
};
pub use unsubscribe::unsubscribe;

#[derive(thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    DispatchError(#[from] DispatchError),
    #[error("Something went wrong")]
    UnexpectedError(#[from] anyhow::Error),
}

impl Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(message) => ApiError::Conflict(message),
            e => ApiError::UnexpectedError(e.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::DispatchError(e) => match e {
                DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
                DispatchError::NoRecipients => StatusCode::UNPROCESSABLE_ENTITY,
                DispatchError::AlreadyInProgress(_) => StatusCode::CONFLICT,
                DispatchError::ChannelConnectFailed(_) => StatusCode::BAD_GATEWAY,
                DispatchError::SendFailed { report, .. } => {
                    tracing::warn!("{:?}", self);
                    return (StatusCode::BAD_GATEWAY, Json(report.clone())).into_response();
                }
                DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::UnexpectedError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("{:?}", self);
        }
        (status, Json(self.to_string())).into_response()
    }
}

/// Explains why a conditional update touched nothing.
async fn missing_or_conflict(
    store: &Arc<dyn Store>,
    id: Uuid,
    conflict: &str,
) -> Result<ApiError, ApiError> {
    match store.newsletter(id).await? {
        Some(_) => Ok(ApiError::Conflict(conflict.to_string())),
        None => Ok(newsletter_not_found(id)),
    }
}

fn newsletter_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Newsletter {} does not exist", id))
}
