//! Authorization gate for the ingestion entry points.
//!
//! Callers present a bearer credential; the gate resolves it to an
//! identity and role before any run log row exists. The internal-call
//! marker header is honored only on the single-source path.

use std::collections::HashSet;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::error::ApiError;

/// Marker header set when the aggregate orchestrator (or another trusted
/// internal service) calls the single-source entry point.
pub const INTERNAL_CALL_HEADER: &str = "x-podium-internal";

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub admin_tokens: HashSet<String>,
    pub member_tokens: HashSet<String>,
    /// Machine credential for scheduled runs.
    pub service_token: Option<String>,
    /// Shared secret expected in the internal-call marker header.
    pub internal_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    User(Role),
    Service,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Aggregate,
    SingleSource,
}

/// Resolve the caller's identity or 401. A recognized-but-underprivileged
/// identity is not an error here; the entry-point check decides 403.
pub fn resolve_identity(config: &AuthConfig, headers: &HeaderMap) -> Result<Identity, ApiError> {
    if let Some(marker) = headers.get(INTERNAL_CALL_HEADER) {
        let presented = marker
            .to_str()
            .map_err(|_| ApiError::Unauthorized("malformed internal-call marker".into()))?;
        return match &config.internal_secret {
            Some(secret) if presented == secret => Ok(Identity::Internal),
            _ => Err(ApiError::Unauthorized(
                "unrecognized internal-call marker".into(),
            )),
        };
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer credential".into()))?;

    if config.admin_tokens.contains(bearer) {
        return Ok(Identity::User(Role::Admin));
    }
    if config.service_token.as_deref() == Some(bearer) {
        return Ok(Identity::Service);
    }
    if config.member_tokens.contains(bearer) {
        return Ok(Identity::User(Role::Member));
    }
    Err(ApiError::Unauthorized("unrecognized credential".into()))
}

pub fn require_ingest_access(identity: Identity, entry: EntryPoint) -> Result<(), ApiError> {
    match identity {
        Identity::User(Role::Admin) | Identity::Service => Ok(()),
        Identity::Internal if entry == EntryPoint::SingleSource => Ok(()),
        Identity::Internal => Err(ApiError::Forbidden(
            "internal-call marker is only valid for single-source runs".into(),
        )),
        Identity::User(Role::Member) => Err(ApiError::Forbidden(
            "administrator role required for ingestion runs".into(),
        )),
    }
}
