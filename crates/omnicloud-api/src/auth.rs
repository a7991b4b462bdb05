//! Node authentication: header-based identity for site calls and
//! registration-key hashing.

use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::ApiState;

/// Header carrying the node id on site-to-hub calls.
pub const HEADER_SERVER_ID: &str = "x-server-id";

/// Header carrying the MAC address on site-to-hub calls.
pub const HEADER_MAC_ADDRESS: &str = "x-mac-address";

/// The authenticated node, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthedNode {
    /// The verified node id.
    pub node_id: Uuid,
}

/// Hash a registration key for storage.
///
/// # Errors
///
/// Returns an error if hashing fails.
pub fn hash_registration_key(key: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ApiError::internal(format!("key hashing failed: {err}")))
}

/// Verify a presented key against a stored hash.
#[must_use]
pub fn verify_registration_key(stored_hash: &str, presented: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|hash| {
            Argon2::default()
                .verify_password(presented.as_bytes(), &hash)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Extract and verify the `(X-Server-ID, X-MAC-Address)` pair against the
/// nodes table. Used by the middleware and the WebSocket upgrade.
///
/// # Errors
///
/// Returns 401 for unknown identity, 403 for unauthorized nodes.
pub async fn authenticate_node(
    state: &ApiState,
    node_id: Uuid,
    mac: &str,
) -> Result<AuthedNode, ApiError> {
    let node = state
        .catalog
        .node(node_id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown node"))?;
    if !node.mac.eq_ignore_ascii_case(mac) {
        return Err(ApiError::unauthorized("mac address mismatch"));
    }
    if !node.authorized {
        return Err(ApiError::forbidden("node is not authorized"));
    }
    Ok(AuthedNode { node_id })
}

/// Header-based authentication for handlers that share a path with an
/// operator surface and cannot ride the middleware.
///
/// # Errors
///
/// Returns the same 400/401/403 responses as the middleware.
pub async fn authenticate_headers(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<AuthedNode, ApiError> {
    let (node_id, mac) = read_identity_headers(headers)?;
    authenticate_node(state, node_id, &mac).await
}

/// Middleware requiring the site identity headers.
pub async fn require_node(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (node_id, mac) = read_identity_headers(request.headers())?;
    let authed = authenticate_node(&state, node_id, &mac).await?;
    request.extensions_mut().insert(authed);
    Ok(next.run(request).await)
}

fn read_identity_headers(headers: &HeaderMap) -> Result<(Uuid, String), ApiError> {
    let node_id = headers
        .get(HEADER_SERVER_ID)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-Server-ID header"))?;
    let node_id = node_id
        .parse::<Uuid>()
        .map_err(|_err| ApiError::bad_request("X-Server-ID is not a UUID"))?;
    let mac = headers
        .get(HEADER_MAC_ADDRESS)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-MAC-Address header"))?;
    Ok((node_id, mac.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_verifies_only_the_original() {
        let hash = hash_registration_key("secret").expect("hash");
        assert!(verify_registration_key(&hash, "secret"));
        assert!(!verify_registration_key(&hash, "wrong"));
        assert!(!verify_registration_key("not-a-hash", "secret"));
    }
}
