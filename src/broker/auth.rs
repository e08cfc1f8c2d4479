//! Credential checks for CONNECT
//!
//! The engine asks an [`Authenticator`] whether a client may connect. Real
//! credential backends plug in behind this trait; the crate ships an
//! allow-everything implementation and a static username/password table.

use std::collections::HashMap;

use crate::broker::message::ConnectReturnCode;

/// Outcome of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    BadCredentials,
    NotAuthorized,
}

impl AuthDecision {
    /// The CONNACK code reporting this decision.
    pub fn return_code(self) -> ConnectReturnCode {
        match self {
            AuthDecision::Allow => ConnectReturnCode::Accepted,
            AuthDecision::BadCredentials => ConnectReturnCode::BadUsernameOrPassword,
            AuthDecision::NotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthDecision;
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Username/password table. Clients without a username are left to the
/// engine's anonymous policy.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthDecision {
        let Some(username) = username else {
            return AuthDecision::Allow;
        };
        match self.users.get(username) {
            Some(expected) if password == Some(expected.as_bytes()) => AuthDecision::Allow,
            Some(_) => AuthDecision::BadCredentials,
            None => AuthDecision::NotAuthorized,
        }
    }
}
