mod middleware;
mod password;

pub use middleware::require_admin;
pub use password::{validate_credentials, AdminCredentials, AuthError, Credentials};
