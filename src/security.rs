use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{http::header, Error};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;

use crate::config::Settings;

// Post images are served from our own /media/ path; nothing is inlined.
const DEFAULT_CSP: &str = "default-src 'self'; img-src 'self'; object-src 'none'; base-uri 'none'; frame-ancestors 'none'; form-action 'self'";

/// Adds the standard hardening headers to every response that does not set
/// them itself.
#[derive(Clone)]
pub struct SecurityHeaders {
    pub enable_hsts: bool,
    pub csp: &'static str,
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self { enable_hsts: false, csp: DEFAULT_CSP }
    }
}

impl SecurityHeaders {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::default().with_hsts(settings.enable_hsts)
    }

    pub fn with_hsts(mut self, enable: bool) -> Self {
        self.enable_hsts = enable;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SecurityHeadersMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityHeadersMiddleware { service: Rc::new(service), cfg: self.clone() }))
    }
}

pub struct SecurityHeadersMiddleware<S> {
    service: Rc<S>,
    cfg: SecurityHeaders,
}

impl<S, B> Service<ServiceRequest> for SecurityHeadersMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let cfg = self.cfg.clone();
        Box::pin(async move {
            let mut res = svc.call(req).await?;
            let headers = res.response_mut().headers_mut();
            let mut set_default = |name: header::HeaderName, value: &'static str| {
                if !headers.contains_key(&name) {
                    headers.insert(name, header::HeaderValue::from_static(value));
                }
            };
            set_default(header::CONTENT_SECURITY_POLICY, cfg.csp);
            set_default(header::REFERRER_POLICY, "same-origin");
            set_default(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
            set_default(header::X_FRAME_OPTIONS, "DENY");
            if cfg.enable_hsts {
                set_default(header::STRICT_TRANSPORT_SECURITY, "max-age=63072000; includeSubDomains");
            }
            Ok(res)
        })
    }
}
