//! Admission control at the ingestion boundary.
//!
//! [`RateLimit`] wraps the transcription routes and consults an
//! [`AdmissionPolicy`] before the request reaches a handler. The shipped policy
//! is a fixed one-minute window per source address; rejected requests get
//! `429 {"detail": "Rate limit exceeded. Please slow down."}`.

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use std::collections::HashMap;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::AppError;

/// Decides whether a request from `key` may proceed.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, key: &str) -> bool;
}

/// At most `limit` admissions per key per window. A limit of 0 admits everything.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

/// Prune expired windows once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 4096;

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

impl AdmissionPolicy for FixedWindowLimiter {
    fn admit(&self, key: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, (started, _)| now.duration_since(*started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Middleware factory; cheap to clone into each worker's `App`.
#[derive(Clone)]
pub struct RateLimit {
    policy: Arc<dyn AdmissionPolicy>,
}

impl RateLimit {
    pub fn new(policy: Arc<dyn AdmissionPolicy>) -> Self {
        Self { policy }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddleware {
            service: Rc::new(service),
            policy: self.policy.clone(),
        }))
    }
}

pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    policy: Arc<dyn AdmissionPolicy>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Keyed on the socket peer, not on forwarding headers a client controls.
        let key = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if !self.policy.admit(&key) {
            warn!(remote_addr = %key, path = %req.path(), "Rate limit exceeded");
            let response = AppError::RateLimited.error_response();
            let rejected = req.into_response(response).map_into_right_body();
            return Box::pin(async move { Ok(rejected) });
        }

        let service = self.service.clone();
        Box::pin(async move {
            let response = service.call(req).await?;
            Ok(response.map_into_left_body())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as actix_test, web, App, HttpResponse};
    use std::net::SocketAddr;

    #[test]
    fn test_fixed_window_counts_per_key() {
        let limiter = FixedWindowLimiter::per_minute(2);
        assert!(limiter.admit("10.0.0.1"));
        assert!(limiter.admit("10.0.0.1"));
        assert!(!limiter.admit("10.0.0.1"));
        assert!(limiter.admit("10.0.0.2"));
    }

    #[test]
    fn test_window_resets() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.admit("a"));
    }

    #[test]
    fn test_zero_limit_disables() {
        let limiter = FixedWindowLimiter::per_minute(0);
        for _ in 0..1000 {
            assert!(limiter.admit("a"));
        }
    }

    #[actix_web::test]
    async fn test_middleware_rejects_with_429() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RateLimit::new(Arc::new(FixedWindowLimiter::per_minute(1))))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;
        let peer: SocketAddr = "192.0.2.7:4000".parse().unwrap();

        let req = actix_test::TestRequest::get().uri("/").peer_addr(peer).to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = actix_test::TestRequest::get().uri("/").peer_addr(peer).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Rate limit exceeded. Please slow down.");
    }
}
