use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::SYSTEM_ACTOR;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Session passwords. Users share `password`; the user and listing
/// subsystems connect as [`SYSTEM_ACTOR`] with `system_password`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password: String,
    pub system_password: String,
}

/// Cleartext password source. The user name must be the actor's ULID, so a
/// session that could never act is turned away at startup.
#[derive(Debug)]
pub struct StayflowAuthSource {
    credentials: Credentials,
}

impl StayflowAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for StayflowAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().map(|u| u.to_string()).unwrap_or_default();
        let Ok(actor) = Ulid::from_string(&user) else {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user {user:?} is not a user id"),
            ))));
        };
        let password = if actor == SYSTEM_ACTOR {
            &self.credentials.system_password
        } else {
            &self.credentials.password
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
