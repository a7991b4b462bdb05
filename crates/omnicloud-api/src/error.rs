//! Problem-detail API error wrapper.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use omnicloud_api_models::ProblemDetails;
use omnicloud_catalog::CatalogError;

/// Structured API error rendered as a problem-detail body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    title: &'static str,
    detail: Option<String>,
}

impl ApiError {
    const fn new(status: StatusCode, kind: &'static str, title: &'static str) -> Self {
        Self {
            status,
            kind,
            title,
            detail: None,
        }
    }

    /// Attach a detail line.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// 500 with a detail line.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "fatal",
            "internal server error",
        )
        .with_detail(detail)
    }

    /// 401 with a detail line.
    #[must_use]
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        )
        .with_detail(detail)
    }

    /// 403 with a detail line.
    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", "forbidden").with_detail(detail)
    }

    /// 400 with a detail line.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", "bad request").with_detail(detail)
    }

    /// 404 with a detail line.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "resource not found").with_detail(detail)
    }

    /// 409 with a detail line.
    #[must_use]
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "validation", "conflict").with_detail(detail)
    }

    /// 503 with a detail line.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "transient",
            "service unavailable",
        )
        .with_detail(detail)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match &err {
            CatalogError::NotFound { entity, id } => {
                Self::not_found(format!("{entity} {id} not found"))
            }
            CatalogError::InvalidTransition { from, to, .. } => {
                Self::conflict(format!("transfer cannot move from {from} to {to}"))
            }
            CatalogError::Database { .. } => Self::unavailable("catalog unavailable"),
            CatalogError::Decode { .. } | CatalogError::AmbiguousCanonical { .. } => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemDetails {
            kind: self.kind.to_string(),
            title: self.title.to_string(),
            status: self.status.as_u16(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_errors_map_to_statuses() {
        let not_found = ApiError::from(CatalogError::NotFound {
            entity: "transfer",
            id: "x".to_string(),
        });
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let transition = ApiError::from(CatalogError::InvalidTransition {
            transfer_id: uuid::Uuid::nil(),
            from: "completed",
            to: "downloading",
        });
        assert_eq!(transition.status, StatusCode::CONFLICT);
    }
}
