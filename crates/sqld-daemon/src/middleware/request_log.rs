use std::{
    convert::Infallible,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::{
    http::{Method, Request, StatusCode},
    response::Response,
};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{error, info, warn};

/// Logs one line per response with method, path, status and elapsed time.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestLogLayer;

impl<S> Layer<S> for RequestLogLayer {
    type Service = RequestLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct RequestLogService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RequestLogService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let started = Instant::now();

        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(request).await?;
            log_response(&method, &path, response.status(), started.elapsed());
            Ok(response)
        })
    }
}

pub fn log_response(method: &Method, path: &str, status: StatusCode, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
    let status = status.as_u16();
    if status >= 500 {
        error!(%method, path, status, elapsed_ms, "request failed");
    } else if status >= 400 {
        warn!(%method, path, status, elapsed_ms, "request rejected");
    } else {
        info!(%method, path, status, elapsed_ms, "request served");
    }
}
