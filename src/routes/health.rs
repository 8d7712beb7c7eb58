//! Liveness and readiness endpoints for orchestrators and tests.

use rocket::State;
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::auth::AuthState;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// `ok` when healthy, `unavailable` otherwise.
    pub status: String,
}

impl HealthResponse {
    fn new(status: &str) -> Json<Self> {
        Json(Self {
            status: status.to_string(),
        })
    }
}

/// The process is up and serving requests.
#[openapi(tag = "Health")]
#[get("/health/live")]
pub fn live() -> Json<HealthResponse> {
    HealthResponse::new("ok")
}

/// The identity store answers within its timeout.
#[openapi(tag = "Health")]
#[get("/health/ready")]
pub async fn ready(state: &State<AuthState>) -> status::Custom<Json<HealthResponse>> {
    match state.auth_service.store().ping().await {
        Ok(()) => status::Custom(Status::Ok, HealthResponse::new("ok")),
        Err(err) => {
            log::warn!("readiness check failed: {}", err);
            status::Custom(Status::ServiceUnavailable, HealthResponse::new("unavailable"))
        }
    }
}
