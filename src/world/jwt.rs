//! World admin authentication (spec.md §6.2 "World HTTP surface").
//!
//! The specification treats the JWT primitive itself as a host-supplied
//! dependency (Non-goal: "reimplementing JWT"); this module only verifies
//! tokens the host already issued. Grounded on the `jsonwebtoken` crate, the
//! same HS256-claims-checking shape used across the broader example pack
//! for admin/service authentication (e.g. identity-server style guards).

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};

use crate::config::WorldAuthConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct WorldAdminClaims {
    /// Subject: the admin principal this token was issued to.
    pub sub: String,
    /// World ids this token is authorized to administer.
    #[serde(default)]
    pub worlds: Vec<String>,
    pub exp: usize,
}

/// Request guard admitting a caller who presents a valid `Authorization:
/// Bearer <jwt>` header, HS256-signed with the world's configured secret.
pub struct WorldAdmin {
    pub claims: WorldAdminClaims,
}

impl WorldAdmin {
    pub fn authorizes(&self, world_id: &str) -> bool {
        self.claims.worlds.iter().any(|w| w == world_id)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WorldAdmin {
    type Error = String;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match req.rocket().state::<WorldAuthConfig>() {
            Some(c) => c,
            None => return Outcome::Error((Status::InternalServerError, "world auth not configured".into())),
        };
        let Some(secret) = &config.jwt_secret else {
            return Outcome::Error((Status::InternalServerError, "AUTH_JWT_SECRET not set".into()));
        };

        let Some(header) = req.headers().get_one("Authorization") else {
            return Outcome::Error((Status::Unauthorized, "missing Authorization header".into()));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Outcome::Error((Status::Unauthorized, "expected Bearer token".into()));
        };

        let decoding_key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());
        let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        match jsonwebtoken::decode::<WorldAdminClaims>(token, &decoding_key, &validation) {
            Ok(data) => Outcome::Success(WorldAdmin { claims: data.claims }),
            Err(e) => Outcome::Error((Status::Unauthorized, format!("invalid token: {e}"))),
        }
    }
}

/// Accepts either caller the administrative endpoints allow (spec.md §4.5
/// "Administrative endpoints ... require either a valid JWT ... OR an
/// `X-Access-Shard` header"). Tries [`WorldAdmin`] first since most callers
/// of `update-shard`/`scale-room` carry a human JWT; falls back to
/// [`ShardAuth`] for the shard's own heartbeat calls.
pub enum WorldCaller {
    Admin(WorldAdminClaims),
    Shard,
}

impl WorldCaller {
    /// `true` unless this is an admin caller whose token doesn't list
    /// `world_id`; a shard caller is always authorized (it has no `worlds`
    /// claim to check against).
    pub fn authorizes(&self, world_id: &str) -> bool {
        match self {
            WorldCaller::Admin(claims) => claims.worlds.iter().any(|w| w == world_id),
            WorldCaller::Shard => true,
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WorldCaller {
    type Error = String;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match WorldAdmin::from_request(req).await {
            Outcome::Success(admin) => Outcome::Success(WorldCaller::Admin(admin.claims)),
            _ => match ShardAuth::from_request(req).await {
                Outcome::Success(_) => Outcome::Success(WorldCaller::Shard),
                Outcome::Error(e) => Outcome::Error(e),
                Outcome::Forward(f) => Outcome::Forward(f),
            },
        }
    }
}

/// Request guard for intra-cluster shard calls (spec.md §4.6 "Shard
/// proxy"), authenticated with a shared secret instead of a per-admin JWT
/// since shards aren't human principals.
pub struct ShardAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ShardAuth {
    type Error = String;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match req.rocket().state::<WorldAuthConfig>() {
            Some(c) => c,
            None => return Outcome::Error((Status::InternalServerError, "world auth not configured".into())),
        };
        let Some(expected) = &config.shard_secret else {
            return Outcome::Error((Status::InternalServerError, "SHARD_SECRET not set".into()));
        };
        match req.headers().get_one("X-Access-Shard") {
            Some(got) if got == expected => Outcome::Success(ShardAuth),
            Some(_) => Outcome::Error((Status::Unauthorized, "bad shard secret".into())),
            None => Outcome::Error((Status::Unauthorized, "missing X-Access-Shard header".into())),
        }
    }
}
