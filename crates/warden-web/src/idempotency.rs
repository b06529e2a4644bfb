use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use warden_auth::idempotency::{IDEMPOTENCY_HEADER, REPLAY_HEADER, actor_key};
use warden_auth::{AuthError, Begin, IdempotentRequest, Outcome};

use crate::auth::{AuthUser, ClientInfo, header_str};
use crate::envelope::{ApiError, ApiOk};
use crate::state::AppState;

/// Set by the middleware on requests it already deduplicates.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyManaged;

pub async fn idempotency_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let coordinator = &state.idempotency;
    let config = coordinator.config();
    if !config.enabled
        || !config.applies_to(request.method().as_str())
        || request.headers().get(IDEMPOTENCY_HEADER).is_none()
    {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, config.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => {
            return ApiError(AuthError::InvalidInput("request body is too large".into()))
                .into_response();
        }
    };

    let payload = request_payload(&bytes, &parts.uri);
    let key = header_str(&parts.headers, IDEMPOTENCY_HEADER).map(str::to_string);
    let actor = request_actor_key(&parts);
    let method = parts.method.as_str().to_string();
    let route = parts.uri.path().to_string();
    let req = IdempotentRequest {
        key: key.as_deref(),
        actor_key: actor,
        method: &method,
        route: &route,
        payload: &payload,
    };

    let record = match coordinator.begin(&req, Utc::now()).await {
        Ok(Begin::Bypass) => {
            return next.run(Request::from_parts(parts, Body::from(bytes))).await;
        }
        Ok(Begin::Replay { status, payload }) => return replay_response(status, payload),
        Ok(Begin::Proceed { record, .. }) => record,
        Err(e) => return ApiError(e).into_response(),
    };

    parts.extensions.insert(IdempotencyManaged);
    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (res_parts, res_body) = response.into_parts();
    let res_bytes = match axum::body::to_bytes(res_body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            if let Err(mark) = coordinator.mark_failed(&record, Utc::now()).await {
                tracing::error!(error = %mark, "failed to mark idempotency record failed");
            }
            return ApiError(AuthError::Internal(format!("cannot buffer response: {e}")))
                .into_response();
        }
    };

    let status = res_parts.status.as_u16();
    let stored = if status < 500 {
        let body = String::from_utf8_lossy(&res_bytes);
        coordinator.complete(&record, status, &body, Utc::now()).await
    } else {
        coordinator.mark_failed(&record, Utc::now()).await
    };
    if let Err(e) = stored {
        tracing::error!(error = %e, status, "failed to persist idempotency outcome");
    }

    Response::from_parts(res_parts, Body::from(res_bytes))
}

/// JSON body merged with query parameters; a non-JSON body is hashed as a
/// string.
fn request_payload(bytes: &Bytes, uri: &Uri) -> Value {
    let mut payload = if bytes.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
    };
    let query = Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    if query.is_empty() {
        return payload;
    }
    match &mut payload {
        Value::Object(map) => {
            for (k, v) in query {
                map.entry(k).or_insert(Value::String(v));
            }
            payload
        }
        _ => {
            let mut map = Map::new();
            map.insert("body".into(), payload);
            for (k, v) in query {
                map.insert(k, Value::String(v));
            }
            Value::Object(map)
        }
    }
}

fn request_actor_key(parts: &Parts) -> String {
    let user_id = parts.extensions.get::<AuthUser>().map(AuthUser::user_id);
    let client = ClientInfo::from_parts(&parts.headers, &parts.extensions);
    actor_key(user_id, &client.ip, &client.user_agent)
}

fn replay_response(status: u16, payload: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = (status, payload).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(REPLAY_HEADER, HeaderValue::from_static("1"));
    response
}

/// Request facts the explicit wrapper needs, captured before the body is
/// consumed.
#[derive(Debug, Clone)]
pub struct IdempotencyInfo {
    pub key: Option<String>,
    pub method: String,
    pub route: String,
    pub actor_key: String,
    pub managed: bool,
}

impl<S> FromRequestParts<S> for IdempotencyInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(IdempotencyInfo {
            key: header_str(&parts.headers, IDEMPOTENCY_HEADER).map(str::to_string),
            method: parts.method.as_str().to_string(),
            route: parts.uri.path().to_string(),
            actor_key: request_actor_key(parts),
            managed: parts.extensions.get::<IdempotencyManaged>().is_some(),
        })
    }
}

/// Per-action idempotency. A pass-through when the middleware already
/// manages the request.
pub async fn idempotent<T, F, Fut>(
    state: &AppState,
    info: &IdempotencyInfo,
    payload: &Value,
    handler: F,
) -> Result<Response, ApiError>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ApiOk<T>, ApiError>>,
{
    if info.managed {
        return Ok(handler().await?.into_response());
    }

    let req = IdempotentRequest {
        key: info.key.as_deref(),
        actor_key: info.actor_key.clone(),
        method: &info.method,
        route: &info.route,
        payload,
    };
    let outcome = state
        .idempotency
        .run(&req, move || async move {
            let ok = handler().await.map_err(|ApiError(e)| e)?;
            Ok::<_, AuthError>((StatusCode::OK.as_u16(), ok.to_body()?))
        })
        .await?;

    Ok(match outcome {
        Outcome::Replayed { status, payload } => replay_response(status, payload),
        Outcome::Executed { status, payload } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let mut response = (status, payload).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_params_join_json_payload() {
        let uri: Uri = "/api/users?force=1".parse().unwrap();
        let payload = request_payload(&Bytes::from_static(br#"{"name":"a"}"#), &uri);
        assert_eq!(payload, json!({"name": "a", "force": "1"}));
    }

    #[test]
    fn empty_body_is_empty_object() {
        let uri: Uri = "/api/users".parse().unwrap();
        assert_eq!(request_payload(&Bytes::new(), &uri), json!({}));
    }

    #[test]
    fn replay_marks_response() {
        let res = replay_response(201, "{}".into());
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers().get(REPLAY_HEADER).unwrap(), "1");
    }
}
