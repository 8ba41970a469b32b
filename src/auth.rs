use actix_web::cookie::{Cookie, SameSite};
use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};

use crate::error::ApiError;
use crate::models::{Id, User};

pub const SESSION_COOKIE: &str = "quill_session";
const TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub username: String,
    pub exp: usize,
    pub roles: Vec<Role>,
}

impl Claims {
    pub fn user_id(&self) -> Result<Id, ApiError> {
        self.sub.parse().map_err(|_| ApiError::Unauthorized)
    }
}

fn jwt_secret() -> Result<String, ApiError> {
    env::var("JWT_SECRET").map_err(|_| {
        tracing::error!("JWT_SECRET not set");
        ApiError::Internal
    })
}

/// Validate a JWT and return its claims.
fn decode_jwt(token: &str) -> Result<Claims, ApiError> {
    let secret = jwt_secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|_| ApiError::Unauthorized)?;
    Ok(data.claims)
}

/// Token from the bearer header, falling back to the session cookie.
fn token_from_request(req: &HttpRequest) -> Option<String> {
    let mut pl = Payload::None;
    if let Ok(bearer) = BearerAuth::from_request(req, &mut pl).into_inner() {
        return Some(bearer.token().to_string());
    }
    req.cookie(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// Strict extractor: rejects the request with 401 when no valid token is present.
pub struct Auth(pub Claims);

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        let res = match token_from_request(req) {
            Some(token) => decode_jwt(&token).map(Auth).map_err(Error::from),
            None => Err(ApiError::Unauthorized.into()),
        };
        ready(res)
    }
}

/// The visitor behind a request; `None` for anonymous visitors. Never fails,
/// a bad or expired token simply reads as anonymous.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<Claims>);

impl CurrentUser {
    pub fn claims(&self) -> Option<&Claims> {
        self.0.as_ref()
    }

    /// Claims of a logged-in user, or a login redirect back to this request's path.
    pub fn require(&self, req: &HttpRequest) -> Result<&Claims, ApiError> {
        self.0.as_ref().ok_or_else(|| ApiError::LoginRequired { next: req.path().to_string() })
    }

    pub fn user_id(&self) -> Option<Id> {
        self.0.as_ref().and_then(|c| c.sub.parse().ok())
    }
}

impl FromRequest for CurrentUser {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        let claims = token_from_request(req).and_then(|t| decode_jwt(&t).ok());
        ready(Ok(CurrentUser(claims)))
    }
}

/// Helper macro for role-guarding handlers.
#[macro_export]
macro_rules! require_role {
    ($claims:expr, $role:pat) => {
        if !$claims.roles.iter().any(|r| matches!(r, $role)) {
            return Err($crate::error::ApiError::Forbidden);
        }
    };
}

pub fn roles_for(user: &User) -> Vec<Role> {
    if user.is_staff { vec![Role::User, Role::Admin] } else { vec![Role::User] }
}

/// Create a JWT for a user
pub fn create_jwt(user_id: Id, username: &str, roles: Vec<Role>) -> Result<String, ApiError> {
    let secret = jwt_secret()?;
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(TOKEN_LIFETIME_HOURS))
        .ok_or(ApiError::Internal)?
        .timestamp() as usize;

    let claims = Claims { sub: user_id.to_string(), username: username.to_string(), exp: expiration, roles };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(|e| {
        tracing::error!("failed to encode jwt: {e}");
        ApiError::Internal
    })
}

pub fn session_cookie(token: &str, secure: bool) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, token.to_string())
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(actix_web::cookie::time::Duration::hours(TOKEN_LIFETIME_HOURS))
        .finish()
}

pub fn expired_session_cookie() -> Cookie<'static> {
    let mut c = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    c.make_removal();
    c
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!("failed to hash password: {e}");
            ApiError::Internal
        })
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}
