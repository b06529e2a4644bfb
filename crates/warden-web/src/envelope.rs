use axum::Json;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use warden_auth::{AuthError, ErrorCode};

use crate::request_context;

/// Wire envelope shared by every response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub code: &'static str,
    pub msg: String,
    pub data: T,
    pub request_id: String,
    pub trace_id: String,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(code: ErrorCode, msg: impl Into<String>, data: T) -> Self {
        let (request_id, trace_id) = request_context::current()
            .map(|c| (c.request_id, c.trace_id))
            .unwrap_or_default();
        Self {
            code: code.as_str(),
            msg: msg.into(),
            data,
            request_id,
            trace_id,
        }
    }
}

/// Successful result rendered as a `0000` envelope.
#[derive(Debug)]
pub struct ApiOk<T: Serialize>(pub T);

impl<T: Serialize> ApiOk<T> {
    pub fn envelope(&self) -> Envelope<&T> {
        Envelope::new(ErrorCode::Success, "ok", &self.0)
    }

    /// Serialized envelope, as stored for idempotent replay.
    pub fn to_body(&self) -> Result<String, AuthError> {
        Ok(serde_json::to_string(&self.envelope())?)
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self.envelope())).into_response()
    }
}

#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError(AuthError::from(e))
    }
}

pub type ApiResult<T> = Result<ApiOk<T>, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let expose = request_context::current().is_some_and(|c| c.expose_errors);
        if err.is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, code = err.code().as_str(), "request rejected");
        }

        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let data = match &err {
            AuthError::Conflict {
                current_version,
                current_updated_at,
                ..
            } => json!({
                "currentVersion": current_version,
                "currentUpdatedAt": current_updated_at,
            }),
            AuthError::LoginThrottled { retry_after } => json!({ "retryAfter": retry_after }),
            _ => json!({}),
        };

        let mut response = (
            status,
            Json(Envelope::new(err.code(), err.public_message(expose), data)),
        )
            .into_response();
        if let AuthError::LoginThrottled { retry_after } = err {
            if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

/// `Json` whose rejections render as `1002` envelopes.
#[derive(Debug)]
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidJson(value)),
            Err(rejection) => Err(ApiError(AuthError::InvalidInput(rejection.body_text()))),
        }
    }
}

/// Typed view of an already-extracted JSON body.
pub fn from_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, AuthError> {
    T::deserialize(payload).map_err(|e| AuthError::InvalidInput(e.to_string()))
}

/// Error envelope for failures detected outside any handler.
pub fn error_response(status: StatusCode, code: ErrorCode, msg: &str) -> Response {
    (status, Json(Envelope::new(code, msg, Value::Object(Default::default())))).into_response()
}

pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, ErrorCode::NotFound, "Not found")
}

pub async fn method_not_allowed() -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorCode::MethodNotAllowed,
        "Method not allowed",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_hide_detail_outside_debug() {
        let response = ApiError(AuthError::Database("disk I/O error".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn throttled_login_sets_retry_after() {
        let response = ApiError(AuthError::LoginThrottled { retry_after: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn malformed_payload_is_a_param_error() {
        #[derive(Debug, serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            name: String,
        }
        let err = from_payload::<Body>(&json!({"name": 3})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParamError);
    }

    #[test]
    fn success_envelope_shape() {
        let env = Envelope::new(ErrorCode::Success, "ok", json!({"a": 1}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["code"], "0000");
        assert_eq!(v["data"]["a"], 1);
        assert!(v.get("requestId").is_some());
        assert!(v.get("traceId").is_some());
    }
}
