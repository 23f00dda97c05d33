use axum::extract::{Request, State};
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use secrecy::Secret;

use crate::authentication::{validate_credentials, AdminCredentials, AuthError, Credentials};

impl From<Authorization<Basic>> for Credentials {
    fn from(auth: Authorization<Basic>) -> Self {
        Self {
            username: auth.username().into(),
            password: Secret::new(auth.password().into()),
        }
    }
}

/// Lets a request through only with the admin's Basic credentials.
#[tracing::instrument(
    name = "Authenticate admin",
    skip_all,
    fields(username = tracing::field::Empty)
)]
pub async fn require_admin(
    State(admin): State<AdminCredentials>,
    authorization: Option<TypedHeader<Authorization<Basic>>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let TypedHeader(authorization) = authorization.ok_or_else(|| {
        AuthError::InvalidCredentials(anyhow::anyhow!("Missing Basic credentials."))
    })?;
    let credentials: Credentials = authorization.into();
    tracing::Span::current().record("username", &tracing::field::display(&credentials.username));

    validate_credentials(&admin, credentials).await?;

    Ok(next.run(request).await)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::InvalidCredentials(_) => {
                let mut headers = HeaderMap::new();
                headers.append(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Basic realm="admin""#),
                );

                (StatusCode::UNAUTHORIZED, headers, Json(self.to_string()))
            }
            AuthError::UnexpectedError(_) => {
                tracing::error!("{:?}", self);

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    Json(self.to_string()),
                )
            }
        }
        .into_response()
    }
}
