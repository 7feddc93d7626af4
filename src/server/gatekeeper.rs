//! Connection Gatekeeper.
//!
//! Every live connection and every authenticated HTTP call passes through
//! here first. A connection attempt is admitted only when its room reference
//! resolves to an existing project and its bearer credential verifies; any
//! failure is reported as one of the three [`Rejection`] categories before
//! the room is touched.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, header};
use chrono::{Duration, Utc};
use commsync_common::{ParticipantId, Rejection, RoomId};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::db::DbHandle;
use super::models::Identity;

/// Claims carried by a commsync bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Participant id.
    pub sub: String,
    /// Display label shown next to the participant's messages.
    #[serde(default)]
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

/// Signs and verifies HS256 bearer credentials.
#[derive(Clone)]
pub struct CredentialVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl CredentialVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.validate_exp = true;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Decode `token` into an identity. Bad signatures, expired tokens, and
    /// tokens naming the assistant sentinel are all `invalid-credential`.
    pub fn verify(&self, token: &str) -> Result<Identity, Rejection> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| {
                debug!(error = %err, "Credential verification failed");
                Rejection::InvalidCredential
            })?;
        let claims = data.claims;
        let participant_id =
            ParticipantId::user(claims.sub.clone()).map_err(|_| Rejection::InvalidCredential)?;
        let display_label = if claims.email.is_empty() {
            claims.sub
        } else {
            claims.email
        };
        Ok(Identity {
            participant_id,
            display_label,
        })
    }

    /// Mint a credential for `user`, valid for `ttl`.
    pub fn issue(&self, user: &ParticipantId, display_label: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let expires = now
            .checked_add_signed(ttl)
            .context("Credential lifetime is out of range")?;
        let claims = Claims {
            sub: user.as_str().to_string(),
            email: display_label.to_string(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("Failed to sign credential")
    }
}

/// A connection that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub room: RoomId,
    pub identity: Identity,
}

#[derive(Clone)]
pub struct Gatekeeper {
    verifier: CredentialVerifier,
    db: DbHandle,
}

impl Gatekeeper {
    pub fn new(verifier: CredentialVerifier, db: DbHandle) -> Self {
        Self { verifier, db }
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Check a connection attempt. The room is checked before the credential.
    pub async fn admit(
        &self,
        room: Option<&str>,
        credential: Option<&str>,
    ) -> Result<Admission, Rejection> {
        let room: RoomId = room
            .ok_or(Rejection::InvalidRoom)?
            .parse()
            .map_err(|_| Rejection::InvalidRoom)?;

        let exists = self
            .db
            .call(move |db| db.project_exists(room.get()))
            .await
            .map_err(|e| {
                error!(room = %room, error = %e, "Room lookup failed");
                Rejection::InvalidRoom
            })?;
        if !exists {
            return Err(Rejection::InvalidRoom);
        }

        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(Rejection::MissingCredential)?;
        let identity = self.verifier.verify(token)?;

        Ok(Admission { room, identity })
    }

    /// Verify a credential without a room (HTTP calls).
    pub fn authenticate(&self, credential: Option<&str>) -> Result<Identity, Rejection> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(Rejection::MissingCredential)?;
        self.verifier.verify(token)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}
