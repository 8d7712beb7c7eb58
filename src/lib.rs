#[macro_use]
extern crate rocket;

pub mod auth;
pub mod db;
pub mod request_logger;
pub mod routes;
pub mod store;

use crate::auth::{AuthConfig, AuthState, GoogleIdTokenVerifier};
use crate::db::{AuthDb, MIGRATOR};
use crate::request_logger::RequestLogger;
use crate::store::PgIdentityStore;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Catcher, Rocket, Route};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Every route served under `/api/v1`, plus the generated `openapi.json`.
pub fn api_routes() -> Vec<Route> {
    openapi_get_routes![
        // Health routes
        routes::health::live,
        routes::health::ready,
        // Auth routes
        auth::routes::register,
        auth::routes::login,
        auth::routes::google_login,
        auth::routes::refresh,
        auth::routes::me,
        auth::routes::set_active,
    ]
}

/// JSON bodies for failures Rocket produces before a handler runs.
pub fn api_catchers() -> Vec<Catcher> {
    catchers![
        auth::routes::bad_request,
        auth::routes::unauthorized,
        auth::routes::not_found,
        auth::routes::unprocessable,
        auth::routes::internal_error,
    ]
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Put]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(AuthDb::init())
        .attach(cors)
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match AuthDb::fetch(&rocket) {
                Some(db) => match MIGRATOR.run(&**db).await {
                    Ok(_) => {
                        log::info!("database migrations successful");
                        Ok(rocket)
                    }
                    Err(e) => {
                        log::error!("database migrations failed: {}", e);
                        Err(rocket)
                    }
                },
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::try_on_ignite("Auth State", |rocket| async move {
            let pool = match AuthDb::fetch(&rocket) {
                Some(db) => (**db).clone(),
                None => {
                    log::error!("database pool not available for auth state");
                    return Err(rocket);
                }
            };

            let state = AuthConfig::from_env().and_then(|config| {
                log::info!("auth configuration loaded: {:?}", config);
                let store = Arc::new(PgIdentityStore::new(pool, config.store_timeout));
                let verifier = Arc::new(GoogleIdTokenVerifier::from_config(&config)?);
                AuthState::new(config, store, verifier)
            });

            match state {
                Ok(state) => Ok(rocket.manage(state)),
                Err(err) => {
                    log::error!("failed to initialise auth state: {}", err);
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::try_on_ignite("Seed Administrator", |rocket| async move {
            let Some(state) = rocket.state::<AuthState>().cloned() else {
                return Err(rocket);
            };
            match state.seed_admin().await {
                Ok(true) => log::info!("administrator account created"),
                Ok(false) => log::debug!("administrator seeding skipped"),
                Err(err) => {
                    log::error!("administrator seeding failed: {}", err);
                    return Err(rocket);
                }
            }
            Ok(rocket)
        }))
        .mount("/api/v1", api_routes())
        .register("/", api_catchers())
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Auth API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::Utc;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::{self, PgPool};
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::traits::PublicKeyParts;
    use serde_json::{Value, json};

    use crate::auth::config::GOOGLE_JWKS_URL;
    use crate::auth::external::{JwksCache, StaticJwksSource};
    use crate::auth::responses::Role;
    use crate::auth::{AuthConfig, AuthState, ExternalIdentityVerifier, GoogleIdTokenVerifier};
    use crate::store::{IdentityStore, MemoryIdentityStore};

    pub use database::{TestDatabase, TestDatabaseError};

    const PROVIDER_KEY_PEM: &str = include_str!("../tests/fixtures/identity_provider_key.pem");
    const ROGUE_KEY_PEM: &str = include_str!("../tests/fixtures/rogue_provider_key.pem");

    pub const TEST_CLIENT_ID: &str = "test-client.apps.example";
    pub const TEST_ISSUER: &str = "https://accounts.google.com";
    pub const TEST_KID: &str = "test-key-1";

    /// Configuration with a fixed 32-byte secret and the default TTLs.
    pub fn test_auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: b"test-signing-secret-0123456789ab".to_vec(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 604_800,
            external_client_id: TEST_CLIENT_ID.to_string(),
            external_issuers: vec![TEST_ISSUER.to_string()],
            external_jwks_url: GOOGLE_JWKS_URL.to_string(),
            external_timeout: Duration::from_secs(5),
            external_leeway_secs: 0,
            store_timeout: Duration::from_secs(5),
            default_role: Role::Student,
            seed_admin: None,
        }
    }

    /// Stand-in identity provider that signs RS256 ID tokens with a fixture key
    /// and publishes the matching JWKS.
    pub struct TestIdentityProvider {
        pub client_id: String,
        pub issuer: String,
        pub kid: String,
        private_key: RsaPrivateKey,
        encoding_key: EncodingKey,
    }

    impl TestIdentityProvider {
        pub fn new() -> Self {
            Self::from_pem(PROVIDER_KEY_PEM, TEST_KID)
        }

        /// Different key, same kid: tokens look legitimate but fail signature checks.
        pub fn rogue() -> Self {
            Self::from_pem(ROGUE_KEY_PEM, TEST_KID)
        }

        /// Same key published under another kid, as after a key rotation.
        pub fn with_kid(kid: &str) -> Self {
            Self::from_pem(PROVIDER_KEY_PEM, kid)
        }

        fn from_pem(pem: &str, kid: &str) -> Self {
            let private_key = RsaPrivateKey::from_pkcs8_pem(pem).expect("fixture RSA key parses");
            let der = private_key.to_pkcs1_der().expect("fixture RSA key encodes");
            let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

            Self {
                client_id: TEST_CLIENT_ID.to_string(),
                issuer: TEST_ISSUER.to_string(),
                kid: kid.to_string(),
                private_key,
                encoding_key,
            }
        }

        pub fn jwks(&self) -> JwkSet {
            let n = URL_SAFE_NO_PAD.encode(self.private_key.n().to_bytes_be());
            let e = URL_SAFE_NO_PAD.encode(self.private_key.e().to_bytes_be());
            serde_json::from_value(json!({
                "keys": [{
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": self.kid,
                    "n": n,
                    "e": e,
                }]
            }))
            .expect("valid JWKS document")
        }

        /// Verifier trusting this provider's keys, with no clock leeway.
        pub fn verifier(&self) -> GoogleIdTokenVerifier {
            GoogleIdTokenVerifier::new(
                &self.client_id,
                &[self.issuer.clone()],
                0,
                JwksCache::new(Arc::new(StaticJwksSource::new(self.jwks()))),
            )
        }

        pub fn claims(&self, subject: &str, email: &str, name: Option<&str>) -> Value {
            let now = Utc::now().timestamp();
            let mut claims = json!({
                "iss": self.issuer,
                "aud": self.client_id,
                "sub": subject,
                "email": email,
                "email_verified": true,
                "iat": now,
                "exp": now + 3600,
            });
            if let Some(name) = name {
                claims["name"] = json!(name);
            }
            claims
        }

        pub fn sign(&self, claims: &Value) -> String {
            let mut header = Header::new(Algorithm::RS256);
            header.kid = Some(self.kid.clone());
            jsonwebtoken::encode(&header, claims, &self.encoding_key).expect("sign test token")
        }

        pub fn id_token(&self, subject: &str, email: &str, name: Option<&str>) -> String {
            self.sign(&self.claims(subject, email, name))
        }
    }

    impl Default for TestIdentityProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Auth state over an in-memory store, trusting `provider` for external logins.
    pub fn memory_auth_state(
        config: AuthConfig,
        provider: &TestIdentityProvider,
    ) -> (AuthState, Arc<MemoryIdentityStore>) {
        let store = Arc::new(MemoryIdentityStore::new());
        let verifier: Arc<dyn ExternalIdentityVerifier> = Arc::new(provider.verifier());
        let state = AuthState::new(config, store.clone(), verifier).expect("valid test auth state");
        (state, store)
    }

    /// Auth state over an arbitrary store, trusting `provider` for external logins.
    pub fn auth_state_with_store(
        config: AuthConfig,
        store: Arc<dyn IdentityStore>,
        provider: &TestIdentityProvider,
    ) -> AuthState {
        let verifier: Arc<dyn ExternalIdentityVerifier> = Arc::new(provider.verifier());
        AuthState::new(config, store, verifier).expect("valid test auth state")
    }

    /// Helpers for seeding identity rows directly in Postgres-backed tests.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Insert an identity row, returning its id.
        pub async fn insert_identity(
            &self,
            email: &str,
            full_name: &str,
            role: Role,
            password_hash: &str,
            external_subject_id: Option<&str>,
        ) -> Result<i64, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO identities (full_name, email, password_hash, external_subject_id, role) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(full_name)
            .bind(email)
            .bind(password_hash)
            .bind(external_subject_id)
            .bind(role.as_str())
            .fetch_one(self.pool)
            .await
        }

        pub async fn count_by_email(&self, email: &str) -> Result<i64, sqlx::Error> {
            sqlx::query_scalar("SELECT COUNT(*) FROM identities WHERE email = $1")
                .bind(email)
                .fetch_one(self.pool)
                .await
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        use crate::db::MIGRATOR;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral, migrated database for integration tests.
        ///
        /// Uses the server named by `TEST_DATABASE_URL` when set, otherwise starts a
        /// disposable Postgres container. Each instance gets its own database.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let (admin_url, container) = match std::env::var("TEST_DATABASE_URL") {
                    Ok(url) if !url.trim().is_empty() => (url, None),
                    _ => {
                        let container = Postgres::default().start().await?;
                        let host = container.get_host().await?.to_string();
                        let port = container.get_host_port_ipv4(5432).await?;
                        (
                            format!("postgres://postgres:postgres@{}:{}/postgres", host, port),
                            Some(container),
                        )
                    }
                };

                let base_options: PgConnectOptions = admin_url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);
                let admin_options = base_options.clone().database("postgres");

                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let database_name = format!("auth_test_{}", Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", database_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(8)
                    .connect_with(base_options.database(&database_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database(self.admin_options.clone(), &self.database_name).await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            admin_pool.close().await;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database(admin_options, &db_name).await;
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        auth_state: Option<AuthState>,
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                auth_state: None,
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        pub fn manage_auth_state(mut self, state: AuthState) -> Self {
            self.auth_state = Some(state);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment)
                .attach(crate::request_logger::RequestLogger)
                .register("/", crate::api_catchers());

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(state) = self.auth_state {
                rocket = rocket.manage(state);
            }

            rocket
        }

        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
