use actix_web::http::{header, StatusCode};
use actix_web::{HttpRequest, HttpResponse, ResponseError};
use serde::Serialize;

use crate::forms::FormErrors;
use crate::repo::RepoError;

pub const LOGIN_URL: &str = "/auth/login/";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FormErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("bad request")] BadRequest,
    #[error("unauthorized")] Unauthorized,
    #[error("forbidden")] Forbidden,
    #[error("conflict")] Conflict,
    #[error("invalid form")] Validation(FormErrors),
    /// Anonymous visitor on a page that needs a user; answered with a
    /// redirect to the login page carrying the original path.
    #[error("login required")] LoginRequired { next: String },
    #[error("internal error")] Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict,
            RepoError::Internal(msg) => {
                tracing::error!("repository failure: {msg}");
                ApiError::Internal
            }
        }
    }
}

impl From<FormErrors> for ApiError {
    fn from(e: FormErrors) -> Self {
        ApiError::Validation(e)
    }
}

pub fn login_redirect_url(next: &str) -> String {
    format!("{LOGIN_URL}?next={}", urlencoding::encode(next))
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::LoginRequired { .. } => StatusCode::FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::LoginRequired { next } => HttpResponse::Found()
                .insert_header((header::LOCATION, login_redirect_url(next)))
                .finish(),
            ApiError::Validation(errors) => HttpResponse::build(self.status_code()).json(ApiErrorBody {
                error: self.to_string(),
                errors: Some(errors.clone()),
                path: None,
            }),
            _ => HttpResponse::build(self.status_code()).json(ApiErrorBody {
                error: self.to_string(),
                errors: None,
                path: None,
            }),
        }
    }
}

/// Fallback for unmatched routes.
pub async fn not_found(req: HttpRequest) -> HttpResponse {
    HttpResponse::NotFound().json(ApiErrorBody {
        error: ApiError::NotFound.to_string(),
        errors: None,
        path: Some(req.path().to_string()),
    })
}
