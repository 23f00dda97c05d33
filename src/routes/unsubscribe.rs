use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::domain::{RecipientStatus, SubscriberEmail};
use crate::routes::ApiError;
use crate::store::Store;

#[derive(Debug, Serialize)]
pub struct Unsubscribed {
    email: SubscriberEmail,
    status: RecipientStatus,
}

/// Follows the link appended to every newsletter. Repeated visits succeed.
#[tracing::instrument(name = "Unsubscribing a recipient", skip(store, token))]
pub async fn unsubscribe(
    State(store): State<Arc<dyn Store>>,
    Path(token): Path<String>,
) -> Result<Json<Unsubscribed>, ApiError> {
    let recipient = store
        .unsubscribe(&token)
        .await?
        .ok_or_else(|| ApiError::NotFound("Unknown unsubscribe link".to_string()))?;

    tracing::info!(recipient_id = %recipient.id, "Recipient unsubscribed");
    Ok(Json(Unsubscribed {
        email: recipient.email,
        status: recipient.status,
    }))
}
