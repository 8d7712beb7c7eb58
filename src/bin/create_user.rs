use std::io::{self, Write};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use auth_server::auth::passwords::PasswordService;
use auth_server::auth::responses::Role;
use auth_server::auth::service::{MIN_PASSWORD_LEN, normalize_email};
use auth_server::store::{IdentityStore, NewIdentity, PgIdentityStore, StoreError, UniqueKey};

#[derive(Parser, Debug)]
#[command(name = "create_user", about = "Provision an identity with a password")]
struct Args {
    /// Email address for the account (stored trimmed and lower-cased).
    #[arg(long)]
    email: String,

    /// Plaintext password to hash and store for this identity.
    #[arg(long)]
    password: String,

    /// Full name shown in profiles.
    #[arg(long)]
    full_name: String,

    /// Role to assign: STUDENT, INSTRUCTOR or ADMIN.
    #[arg(long, default_value = "STUDENT")]
    role: String,
}

fn fail(message: &str) -> ! {
    let _ = writeln!(io::stderr(), "error: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let email = normalize_email(&args.email);

    if !email.contains('@') {
        fail("email must contain '@'");
    }
    if args.password.chars().count() < MIN_PASSWORD_LEN {
        fail(&format!("password must be at least {MIN_PASSWORD_LEN} characters"));
    }
    if args.full_name.trim().is_empty() {
        fail("full name must not be blank");
    }
    let role = match Role::from_str(&args.role) {
        Ok(role) => role,
        Err(err) => fail(&format!("{err}. Use STUDENT, INSTRUCTOR or ADMIN.")),
    };

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;
    let store = PgIdentityStore::new(pool, Duration::from_secs(10));

    let password_service = PasswordService::new().map_err(|err| {
        io::Error::new(io::ErrorKind::Other, format!("argon2 init failed: {err}"))
    })?;
    let password_hash = password_service
        .hash_password(&args.password)
        .map_err(|err| {
            io::Error::new(io::ErrorKind::Other, format!("password hash failed: {err}"))
        })?;

    let created = store
        .insert(NewIdentity {
            full_name: args.full_name.trim().to_string(),
            email: email.clone(),
            password_hash,
            external_subject_id: None,
            role,
        })
        .await;

    match created {
        Ok(identity) => {
            println!("Created {} identity '{}' with id {}", identity.role, identity.email, identity.id);
            Ok(())
        }
        Err(StoreError::Conflict(UniqueKey::Email)) => {
            fail(&format!("an identity with email '{email}' already exists."))
        }
        Err(err) => Err(err.into()),
    }
}
