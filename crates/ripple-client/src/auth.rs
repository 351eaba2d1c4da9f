//! Authentication hooks.
//!
//! The connection manager asks an [`AuthProvider`] for the credential query
//! parameters of every connect, and asks it to [`authorize`] again when the
//! server rejects the credential as expired. Hosts with renewable tokens
//! implement the trait over their token endpoint; [`TokenAuth`] covers the
//! static-token case.
//!
//! [`authorize`]: AuthProvider::authorize

use std::sync::Mutex;

use async_trait::async_trait;
use ripple_protocol::ErrorInfo;

/// Credential source for connects.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Query parameters carrying the current credential.
    async fn connect_params(&self) -> Result<Vec<(String, String)>, ErrorInfo>;

    /// Obtain a fresh credential after the current one was rejected.
    ///
    /// Failure here escalates the token problem to a connection failure.
    async fn authorize(&self) -> Result<(), ErrorInfo>;
}

/// A fixed token credential.
///
/// The token can be swapped by the host via [`TokenAuth::set_token`], but
/// the client cannot renew it on its own: [`AuthProvider::authorize`] fails.
pub struct TokenAuth {
    token: Mutex<String>,
}

impl TokenAuth {
    /// Wrap a token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(token.into()),
        }
    }

    /// Replace the token used by future connects.
    pub fn set_token(&self, token: impl Into<String>) {
        *self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token.into();
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn connect_params(&self) -> Result<Vec<(String, String)>, ErrorInfo> {
        let token = self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Ok(vec![("accessToken".into(), token)])
    }

    async fn authorize(&self) -> Result<(), ErrorInfo> {
        Err(ErrorInfo::new(
            40_171,
            403,
            "Static token is expired and cannot be renewed",
        ))
    }
}
