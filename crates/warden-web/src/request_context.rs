use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const TRACEPARENT_HEADER: &str = "traceparent";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation ids for the current request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
    /// Whether server-side error detail may be shown to the client.
    pub expose_errors: bool,
}

impl RequestContext {
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }
}

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Context of the request being served on this task, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(Clone::clone).ok()
}

pub async fn request_context(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = from_headers(request.headers(), state.debug);
    request.extensions_mut().insert(ctx.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %ctx.request_id,
        trace_id = %ctx.trace_id,
        user_id = tracing::field::Empty,
    );
    let mut response = CURRENT
        .scope(ctx.clone(), next.run(request))
        .instrument(span)
        .await;

    let headers = response.headers_mut();
    for (name, value) in [
        (REQUEST_ID_HEADER, ctx.request_id.clone()),
        (TRACE_ID_HEADER, ctx.trace_id.clone()),
        (TRACEPARENT_HEADER, ctx.traceparent()),
    ] {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    }
    response
}

/// Adopts well-formed incoming ids and mints the rest.
pub fn from_headers(headers: &HeaderMap, expose_errors: bool) -> RequestContext {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| is_valid_request_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let trace_id = headers
        .get(TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_traceparent)
        .unwrap_or_else(new_trace_id);

    RequestContext {
        request_id,
        trace_id,
        span_id: new_span_id(),
        expose_errors,
    }
}

fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Trace id of a W3C `traceparent` (`00-<32 hex>-<16 hex>-<2 hex>`).
pub fn parse_traceparent(value: &str) -> Option<String> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let ok = version.len() == 2
        && version != "ff"
        && is_lower_hex(version)
        && trace_id.len() == 32
        && is_lower_hex(trace_id)
        && trace_id.bytes().any(|b| b != b'0')
        && parent_id.len() == 16
        && is_lower_hex(parent_id)
        && parent_id.bytes().any(|b| b != b'0')
        && flags.len() == 2
        && is_lower_hex(flags);
    ok.then(|| trace_id.to_string())
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn new_trace_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn new_span_id() -> String {
    // Low half of a v7 uuid is random.
    let id = Uuid::now_v7().simple().to_string();
    id[16..].to_string()
}
