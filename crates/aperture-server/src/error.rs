//! Component error → HTTP status mapping.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// An HTTP-facing error: status, text body, optional Retry-After.
#[derive(Debug)]
pub struct ApiError {
    /// Response status.
    pub status: StatusCode,
    /// Short text body.
    pub message: String,
    /// Retry-After seconds for shed load.
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// A plain error with no retry hint.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), retry_after: None }
    }

    /// 401 with a fixed body.
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut resp = (self.status, self.message).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(v) = header::HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

impl From<blob_store::Error> for ApiError {
    fn from(e: blob_store::Error) -> Self {
        use blob_store::Error as B;
        let status = match &e {
            B::EmptyKey => StatusCode::BAD_REQUEST,
            B::Conflict => StatusCode::CONFLICT,
            B::LengthRequired => StatusCode::LENGTH_REQUIRED,
            B::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            B::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            B::NotFound => StatusCode::NOT_FOUND,
            B::SoftDeleteRequired => StatusCode::FORBIDDEN,
            B::Record(_) | B::Index(_) | B::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %e, "blob store failure");
        }
        Self::new(status, e.to_string())
    }
}

impl From<pipeline::Error> for ApiError {
    fn from(e: pipeline::Error) -> Self {
        use pipeline::Error as P;
        match &e {
            P::BadRequest(_) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            P::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            P::NotFound => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            P::PayloadTooLarge => Self::new(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
            P::UnsupportedMediaType(_) => {
                Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
            }
            P::Timeout { .. } => Self::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            P::Overloaded => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: e.to_string(),
                retry_after: Some(1),
            },
            P::Codec(_) | P::Internal(_) => {
                tracing::error!(error = %e, "pipeline failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<signer::Error> for ApiError {
    fn from(e: signer::Error) -> Self {
        match e {
            signer::Error::InvalidPath => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            signer::Error::Unauthorized | signer::Error::Expired => Self::unauthorized(),
        }
    }
}
