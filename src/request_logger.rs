use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;
use rocket::{Data, Request, Response};
use std::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Per-request values kept in Rocket's local cache.
struct RequestContext {
    started: Instant,
    id: String,
}

/// Fairing to log one line per HTTP request with timing and a request id.
///
/// A caller-supplied `X-Request-Id` is reused; otherwise a fresh UUID is
/// assigned. Either way it is echoed on the response.
pub struct RequestLogger;

fn context<'a>(request: &'a Request<'_>) -> &'a RequestContext {
    request.local_cache(|| RequestContext {
        started: Instant::now(),
        id: request
            .headers()
            .get_one(REQUEST_ID_HEADER)
            .filter(|value| !value.is_empty() && value.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    })
}

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        context(request);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let ctx = context(request);
        let duration = ctx.started.elapsed();

        response.set_header(Header::new(REQUEST_ID_HEADER, ctx.id.clone()));

        log::info!(
            "[{}] {} {} -> {} ({:.2}ms)",
            ctx.id,
            request.method(),
            request.uri(),
            response.status().code,
            duration.as_secs_f64() * 1000.0
        );
    }
}
