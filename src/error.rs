//! Engine-wide error taxonomy, mapped once onto HTTP at the Rocket boundary.
//!
//! The teacher crate returns ad hoc `(Status, Json<Value>)` tuples from each
//! route. Here every fallible engine call returns `Result<T, EngineError>`
//! and the HTTP mapping happens in one place (`impl Responder`), matching
//! the error kinds enumerated in the specification's error-handling design.

use std::time::Duration;

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// World admin mutation rate limit hit (spec.md §4.S.2); carries the
    /// caller's backoff window so the responder can set `Retry-After`.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
}

impl EngineError {
    fn status(&self) -> Status {
        match self {
            EngineError::Transport(_) => Status::BadRequest,
            EngineError::Validation(_) => Status::BadRequest,
            EngineError::Authorization(_) => Status::Forbidden,
            EngineError::NotFound(_) => Status::NotFound,
            EngineError::Conflict(_) => Status::Conflict,
            EngineError::Expired(_) => Status::NotFound,
            EngineError::Infrastructure(_) => Status::InternalServerError,
            EngineError::RateLimited(_) => Status::TooManyRequests,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for EngineError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        if matches!(self, EngineError::Infrastructure(_)) {
            log::error!("infrastructure error: {self}");
        }
        let retry_after = match &self {
            EngineError::RateLimited(d) => Some(*d),
            _ => None,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = Response::build_from(body.respond_to(req)?);
        response.status(self.status());
        if let Some(retry_after) = retry_after {
            response.raw_header("Retry-After", retry_after.as_secs().to_string());
        }
        response.ok()
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Infrastructure(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
