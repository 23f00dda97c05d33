use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::dispatcher::Dispatcher;
use crate::routes::ApiError;
use crate::store::{Statistics, Store};

pub async fn get_statistics(
    State(store): State<Arc<dyn Store>>,
) -> Result<Json<Statistics>, ApiError> {
    Ok(Json(store.statistics().await?))
}

#[tracing::instrument(name = "Checking the relay", skip(dispatcher))]
pub async fn check_relay(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    match dispatcher.check_relay().await {
        Ok(()) => (StatusCode::OK, Json("The relay accepted a connection".to_string())),
        Err(e) => {
            tracing::warn!(error = ?e, "The relay check failed");
            (StatusCode::BAD_GATEWAY, Json(e.to_string()))
        }
    }
}
