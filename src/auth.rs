use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Caller;

/// Shared cleartext password for every login. Identity comes from the
/// startup `user` parameter.
#[derive(Debug)]
pub struct SlotguardAuthSource {
    password: String,
}

impl SlotguardAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotguardAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Resolve a connection's login name into a caller.
pub fn caller_for(user: &str, admins: &HashSet<String>) -> Caller {
    if admins.contains(user) {
        Caller::admin(user)
    } else {
        Caller::user(user)
    }
}
