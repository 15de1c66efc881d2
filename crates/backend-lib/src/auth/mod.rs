// ============================
// duet-backend-lib/src/auth/mod.rs
// ============================
//! Participant identity.

mod service;
mod service_impl;

pub use service::{AuthService, Identity};
pub use service_impl::ClaimedIdentityAuth;
