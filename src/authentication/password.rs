use anyhow::Context;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use secrecy::{ExposeSecret, Secret};

use crate::configuration::AdminSettings;
use crate::utils::error_chain_fmt;

pub struct Credentials {
    pub username: String,
    pub password: Secret<String>,
}

/// The single operator account allowed on the admin routes.
#[derive(Clone)]
pub struct AdminCredentials {
    username: String,
    password_hash: Secret<String>,
}

impl AdminCredentials {
    pub fn new(settings: &AdminSettings) -> Self {
        if PasswordHash::new(settings.password_hash.expose_secret()).is_err() {
            tracing::warn!("admin.password_hash is not an Argon2 PHC string, every admin request will fail");
        }
        Self {
            username: settings.username.clone(),
            password_hash: settings.password_hash.clone(),
        }
    }
}

#[derive(thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials.")]
    InvalidCredentials(#[source] anyhow::Error),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[tracing::instrument(name = "Validate credentials", skip(expected, credentials))]
pub async fn validate_credentials(
    expected: &AdminCredentials,
    credentials: Credentials,
) -> Result<(), AuthError> {
    let username_matches = credentials.username == expected.username;
    let expected_password_hash = expected.password_hash.clone();

    tokio::task::spawn_blocking(move || {
        verify_password_hash(expected_password_hash, credentials.password)
    })
    .await
    .context("Failed to spawn blocking task.")??;

    if !username_matches {
        return Err(AuthError::InvalidCredentials(anyhow::anyhow!(
            "Unknown username."
        )));
    }
    Ok(())
}

#[tracing::instrument(
    name = "Verify password hash",
    skip(expected_password_hash, password_candidate)
)]
fn verify_password_hash(
    expected_password_hash: Secret<String>,
    password_candidate: Secret<String>,
) -> Result<(), AuthError> {
    let expected_password_hash = PasswordHash::new(expected_password_hash.expose_secret())
        .context("Failed to parse hash in PHC string format.")?;

    Argon2::default()
        .verify_password(
            password_candidate.expose_secret().as_bytes(),
            &expected_password_hash,
        )
        .context("Invalid password.")
        .map_err(AuthError::InvalidCredentials)
}
