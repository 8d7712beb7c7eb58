use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{Request, State, catch, get, post, put};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;

use crate::auth::guards::{AuthUser, RequireAdmin};
use crate::auth::responses::{
    AuthResponse, ExternalLoginRequest, LoginRequest, ProfileResponse, RefreshRequest,
    RegisterRequest, SetActiveRequest,
};
use crate::auth::{AuthError, AuthState};

type AuthRouteResult<T> = Result<Json<T>, status::Custom<Json<AuthErrorResponse>>>;

#[derive(Debug, serde::Serialize, serde::Deserialize, JsonSchema)]
pub struct AuthErrorResponse {
    pub status: u16,
    /// Machine-readable kind, e.g. `EMAIL_TAKEN`.
    pub error: String,
    pub message: String,
}

#[openapi(tag = "Auth")]
#[post("/auth/register", data = "<payload>")]
pub async fn register(
    state: &State<AuthState>,
    payload: Json<RegisterRequest>,
) -> AuthRouteResult<AuthResponse> {
    state
        .auth_service
        .register(payload.into_inner())
        .await
        .map(Json)
        .map_err(respond_error)
}

#[openapi(tag = "Auth")]
#[post("/auth/login", data = "<payload>")]
pub async fn login(
    state: &State<AuthState>,
    payload: Json<LoginRequest>,
) -> AuthRouteResult<AuthResponse> {
    state
        .auth_service
        .login(&payload.email, &payload.password)
        .await
        .map(Json)
        .map_err(respond_error)
}

#[openapi(tag = "Auth")]
#[post("/auth/google", data = "<payload>")]
pub async fn google_login(
    state: &State<AuthState>,
    payload: Json<ExternalLoginRequest>,
) -> AuthRouteResult<AuthResponse> {
    if payload.credential.trim().is_empty() {
        return Err(respond_error(AuthError::Validation(
            "credential is required".into(),
        )));
    }

    state
        .auth_service
        .login_with_external_identity(&payload.credential)
        .await
        .map(Json)
        .map_err(respond_error)
}

#[openapi(tag = "Auth")]
#[post("/auth/refresh", data = "<payload>")]
pub async fn refresh(
    state: &State<AuthState>,
    payload: Json<RefreshRequest>,
) -> AuthRouteResult<AuthResponse> {
    state
        .auth_service
        .refresh(payload.refresh_token.trim())
        .await
        .map(Json)
        .map_err(respond_error)
}

#[openapi(tag = "Auth")]
#[get("/auth/me")]
pub async fn me(
    state: &State<AuthState>,
    user: Result<AuthUser, AuthError>,
) -> AuthRouteResult<ProfileResponse> {
    let user = user.map_err(respond_error)?;
    state
        .auth_service
        .profile(&user.email)
        .await
        .map(Json)
        .map_err(respond_error)
}

#[openapi(tag = "Auth")]
#[put("/auth/users/<user_id>/active", data = "<payload>")]
pub async fn set_active(
    state: &State<AuthState>,
    admin: Result<RequireAdmin, AuthError>,
    user_id: i64,
    payload: Json<SetActiveRequest>,
) -> AuthRouteResult<ProfileResponse> {
    let RequireAdmin(admin) = admin.map_err(respond_error)?;
    log::info!(
        "admin {} sets identity {} active={}",
        admin.user_id,
        user_id,
        payload.active
    );

    state
        .auth_service
        .set_active(user_id, payload.active)
        .await
        .map(Json)
        .map_err(respond_error)
}

pub(crate) fn respond_error(err: AuthError) -> status::Custom<Json<AuthErrorResponse>> {
    let status = err.status();
    let message = if status.code >= 500 {
        log::error!("auth request failed: {err:?}");
        match err {
            AuthError::StoreUnavailable(_) | AuthError::VerifierUnavailable(_) => err.to_string(),
            _ => "internal error".to_string(),
        }
    } else {
        err.to_string()
    };

    status::Custom(
        status,
        Json(AuthErrorResponse {
            status: status.code,
            error: err.code().to_string(),
            message,
        }),
    )
}

fn catcher_body(status: Status, error: &str, message: &str) -> Json<AuthErrorResponse> {
    Json(AuthErrorResponse {
        status: status.code,
        error: error.to_string(),
        message: message.to_string(),
    })
}

#[catch(400)]
pub fn bad_request(_: &Request<'_>) -> Json<AuthErrorResponse> {
    catcher_body(Status::BadRequest, "VALIDATION_FAILED", "malformed request")
}

#[catch(401)]
pub fn unauthorized(_: &Request<'_>) -> Json<AuthErrorResponse> {
    catcher_body(Status::Unauthorized, "UNAUTHORIZED", "unauthorized")
}

#[catch(404)]
pub fn not_found(_: &Request<'_>) -> Json<AuthErrorResponse> {
    catcher_body(Status::NotFound, "NOT_FOUND", "resource not found")
}

#[catch(422)]
pub fn unprocessable(_: &Request<'_>) -> Json<AuthErrorResponse> {
    catcher_body(
        Status::UnprocessableEntity,
        "VALIDATION_FAILED",
        "request body does not match the expected shape",
    )
}

#[catch(500)]
pub fn internal_error(_: &Request<'_>) -> Json<AuthErrorResponse> {
    catcher_body(Status::InternalServerError, "INTERNAL", "internal error")
}
