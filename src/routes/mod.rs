//! HTTP surface: world admin routes, room connect/action/request routes,
//! and a small system/health route, mounted by `lib.rs`.

pub mod room_routes;
pub mod system;
pub mod world_routes;

use std::net::IpAddr;

use rocket::request::{FromRequest, Outcome, Request};

/// The caller's address, preferring `X-Forwarded-For` (set by the shard
/// proxy / a fronting load balancer) over the socket peer address. Mirrors
/// the teacher's `ClientIp` guard (`src/routes/mod.rs`).
pub struct ClientIp(pub IpAddr);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(forwarded) = req.headers().get_one("X-Forwarded-For") {
            if let Ok(ip) = forwarded.split(',').next().unwrap_or("").trim().parse() {
                return Outcome::Success(ClientIp(ip));
            }
        }
        match req.client_ip() {
            Some(ip) => Outcome::Success(ClientIp(ip)),
            None => Outcome::Success(ClientIp(IpAddr::from([0, 0, 0, 0]))),
        }
    }
}
