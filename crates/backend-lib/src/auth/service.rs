use crate::error::AppError;
use async_trait::async_trait;

/// A verified participant identity (an email address)
pub type Identity = String;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve the identity a joining peer may record under.
    /// `claimed` is what the client declared; `token` is whatever credential it sent.
    /// A rejected credential is [`AppError::Auth`].
    async fn verify(&self, token: Option<&str>, claimed: &str) -> Result<Identity, AppError>;
}
