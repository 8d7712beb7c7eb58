use auth_server::api_routes;
use auth_server::auth::responses::{AuthResponse, ProfileResponse, Role};
use auth_server::auth::routes::AuthErrorResponse;
use auth_server::test_support::{
    TestIdentityProvider, TestRocketBuilder, memory_auth_state, test_auth_config,
};
use chrono::{Duration, Utc};
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use rocket::serde::json::json;

fn client() -> (Client, TestIdentityProvider) {
    let provider = TestIdentityProvider::new();
    let (state, _) = memory_auth_state(test_auth_config(), &provider);
    let client = TestRocketBuilder::new()
        .mount_api_routes(api_routes())
        .manage_auth_state(state)
        .blocking_client();
    (client, provider)
}

fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

fn register(client: &Client, name: &str, email: &str, role: &str) -> AuthResponse {
    let response = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(
            json!({
                "fullName": name,
                "email": email,
                "password": "secret1",
                "role": role,
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    response.into_json().expect("auth response")
}

#[test]
fn register_then_fetch_profile() {
    let (client, _) = client();
    let registered = register(&client, "Ada Lovelace", "ada@x.com", "STUDENT");

    assert!(registered.user_id > 0);
    assert_eq!(registered.role, Role::Student);

    let response = client
        .get("/api/v1/auth/me")
        .header(bearer(&registered.access_token))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let profile: ProfileResponse = response.into_json().expect("profile");
    assert_eq!(
        profile,
        ProfileResponse {
            id: registered.user_id,
            full_name: "Ada Lovelace".into(),
            email: "ada@x.com".into(),
            role: Role::Student,
        }
    );
}

#[test]
fn responses_use_camel_case_and_hide_secrets() {
    let (client, _) = client();
    let response = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"fullName":"Ada","email":"ada@x.com","password":"secret1"}"#)
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let body: serde_json::Value = response.into_json().expect("json body");
    for key in ["accessToken", "refreshToken", "userId", "fullName", "email", "role"] {
        assert!(body.get(key).is_some(), "missing {key}");
    }
    assert!(body.get("passwordHash").is_none());
    assert!(body.get("password").is_none());
}

#[test]
fn duplicate_registration_is_conflict() {
    let (client, _) = client();
    register(&client, "Ada", "ada@x.com", "STUDENT");

    let response = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"fullName":"Eve","email":"ada@x.com","password":"secret2"}"#)
        .dispatch();
    assert_eq!(response.status(), Status::Conflict);

    let error: AuthErrorResponse = response.into_json().expect("error body");
    assert_eq!(error.status, 409);
    assert_eq!(error.error, "EMAIL_TAKEN");
}

#[test]
fn login_failures_share_one_shape() {
    let (client, _) = client();
    register(&client, "Ada", "ada@x.com", "STUDENT");

    let wrong_password = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"email":"ada@x.com","password":"nope-nope"}"#)
        .dispatch();
    let unknown_email = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"email":"ghost@x.com","password":"secret1"}"#)
        .dispatch();

    assert_eq!(wrong_password.status(), Status::Unauthorized);
    assert_eq!(unknown_email.status(), Status::Unauthorized);

    let a: AuthErrorResponse = wrong_password.into_json().expect("error body");
    let b: AuthErrorResponse = unknown_email.into_json().expect("error body");
    assert_eq!(a.error, "INVALID_CREDENTIALS");
    assert_eq!(a.error, b.error);
    assert_eq!(a.message, b.message);
}

#[test]
fn login_returns_tokens_for_valid_credentials() {
    let (client, _) = client();
    register(&client, "Grace", "grace@x.com", "INSTRUCTOR");

    let response = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"email":"GRACE@x.com","password":"secret1"}"#)
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let body: AuthResponse = response.into_json().expect("auth response");
    assert_eq!(body.email, "grace@x.com");
    assert_eq!(body.role, Role::Instructor);
}

#[test]
fn google_login_accepts_either_field_name() {
    let (client, provider) = client();
    let token = provider.id_token("g-55", "new@x.com", Some("New Person"));

    let first = client
        .post("/api/v1/auth/google")
        .header(ContentType::JSON)
        .body(json!({ "credential": token }).to_string())
        .dispatch();
    assert_eq!(first.status(), Status::Ok);
    let first: AuthResponse = first.into_json().expect("auth response");

    let second = client
        .post("/api/v1/auth/google")
        .header(ContentType::JSON)
        .body(json!({ "assertionToken": token }).to_string())
        .dispatch();
    assert_eq!(second.status(), Status::Ok);
    let second: AuthResponse = second.into_json().expect("auth response");

    assert_eq!(first.user_id, second.user_id);
    assert_eq!(first.role, Role::Student);
}

#[test]
fn google_login_with_forged_token_is_unauthorized() {
    let (client, _) = client();
    let rogue = TestIdentityProvider::rogue();

    let response = client
        .post("/api/v1/auth/google")
        .header(ContentType::JSON)
        .body(json!({ "credential": rogue.id_token("g-1", "eve@x.com", None) }).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);

    let error: AuthErrorResponse = response.into_json().expect("error body");
    assert_eq!(error.error, "INVALID_EXTERNAL_TOKEN");
}

#[test]
fn refresh_exchanges_refresh_token_only() {
    let (client, _) = client();
    let registered = register(&client, "Ada", "ada@x.com", "STUDENT");

    let refreshed = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(json!({ "refreshToken": registered.refresh_token }).to_string())
        .dispatch();
    assert_eq!(refreshed.status(), Status::Ok);
    let refreshed: AuthResponse = refreshed.into_json().expect("auth response");
    assert_eq!(refreshed.user_id, registered.user_id);

    let misuse = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(json!({ "refreshToken": registered.access_token }).to_string())
        .dispatch();
    assert_eq!(misuse.status(), Status::Unauthorized);
    let error: AuthErrorResponse = misuse.into_json().expect("error body");
    assert_eq!(error.error, "UNAUTHORIZED");
}

#[test]
fn me_distinguishes_missing_expired_and_forged_tokens() {
    let provider = TestIdentityProvider::new();
    let config = test_auth_config();
    let (state, _) = memory_auth_state(config.clone(), &provider);
    let tokens = state.token_service.clone();
    let client = TestRocketBuilder::new()
        .mount_api_routes(api_routes())
        .manage_auth_state(state)
        .blocking_client();

    let missing = client.get("/api/v1/auth/me").dispatch();
    assert_eq!(missing.status(), Status::Unauthorized);
    let error: AuthErrorResponse = missing.into_json().expect("error body");
    assert_eq!(error.error, "UNAUTHORIZED");

    let expired = tokens
        .issue_access_token_at(1, "ada@x.com", Role::Student, Utc::now() - Duration::hours(2))
        .expect("issue token");
    let response = client
        .get("/api/v1/auth/me")
        .header(bearer(&expired.token))
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    let error: AuthErrorResponse = response.into_json().expect("error body");
    assert_eq!(error.error, "EXPIRED_TOKEN");

    let mut foreign_config = config;
    foreign_config.jwt_secret = vec![0x5a; 32];
    let (foreign_state, _) = memory_auth_state(foreign_config, &provider);
    let forged = foreign_state
        .token_service
        .issue_access_token(1, "ada@x.com", Role::Admin)
        .expect("issue token");
    let response = client
        .get("/api/v1/auth/me")
        .header(bearer(&forged.token))
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    let error: AuthErrorResponse = response.into_json().expect("error body");
    assert_eq!(error.error, "INVALID_SIGNATURE");
}

#[test]
fn only_admins_can_toggle_active() {
    let (client, _) = client();
    let admin = register(&client, "Root", "root@x.com", "ADMIN");
    let student = register(&client, "Ada", "ada@x.com", "STUDENT");
    let path = format!("/api/v1/auth/users/{}/active", student.user_id);

    let forbidden = client
        .put(path.as_str())
        .header(ContentType::JSON)
        .header(bearer(&student.access_token))
        .body(r#"{"active":false}"#)
        .dispatch();
    assert_eq!(forbidden.status(), Status::Forbidden);

    let allowed = client
        .put(path.as_str())
        .header(ContentType::JSON)
        .header(bearer(&admin.access_token))
        .body(r#"{"active":false}"#)
        .dispatch();
    assert_eq!(allowed.status(), Status::Ok);

    let login = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"email":"ada@x.com","password":"secret1"}"#)
        .dispatch();
    assert_eq!(login.status(), Status::Unauthorized);

    let missing = client
        .put("/api/v1/auth/users/999999/active")
        .header(ContentType::JSON)
        .header(bearer(&admin.access_token))
        .body(r#"{"active":true}"#)
        .dispatch();
    assert_eq!(missing.status(), Status::NotFound);
}

#[test]
fn malformed_bodies_get_json_errors() {
    let (client, _) = client();
    let response = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"email":"ada@x.com"}"#)
        .dispatch();
    assert_eq!(response.status(), Status::UnprocessableEntity);

    let error: AuthErrorResponse = response.into_json().expect("error body");
    assert_eq!(error.error, "VALIDATION_FAILED");
}

#[test]
fn responses_carry_request_id() {
    let (client, _) = client();
    let response = client
        .get("/api/v1/auth/me")
        .header(Header::new("X-Request-Id", "req-123"))
        .dispatch();
    assert_eq!(response.headers().get_one("X-Request-Id"), Some("req-123"));

    let response = client.get("/api/v1/auth/me").dispatch();
    let generated = response.headers().get_one("X-Request-Id").expect("generated id");
    assert!(!generated.is_empty());
}
