use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_OWNER_LEN;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password login. The user name given at startup becomes the
/// booking owner, so it must be present and fit in an owner field.
#[derive(Debug)]
pub struct ReservasAuthSource {
    password: String,
}

impl ReservasAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ReservasAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match login.user() {
            Some(user) if !user.is_empty() && user.len() <= MAX_OWNER_LEN => {
                Ok(Password::new(None, self.password.as_bytes().to_vec()))
            }
            _ => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".to_owned(),
                    "28000".to_owned(),
                    "a user name is required".to_owned(),
                ))))
            }
        }
    }
}
