//! The dual-role proxy handler.
//!
//! A single listener serves both roles: origin-form requests are reverse
//! proxied to the application; absolute-form requests are forward proxied
//! to their own target; CONNECT requests become opaque tunnels. Every
//! non-CONNECT request is evaluated against the header rules, its scope
//! is attached to the request, and the send path re-reads that scope from
//! the request alone before dispatching on the pooled outbound client.

use crate::{
    config::Config, metrics::Metrics, ratelimit::RateLimiter, scope::RequestScope, tunnel,
};
use bytes::Bytes;
use futures::FutureExt;
use http::{
    header::{self, HeaderMap, HeaderValue},
    uri::{Authority, Parts, PathAndQuery, Scheme, Uri},
    Method, StatusCode,
};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{body::Incoming, Request, Response};
use hyper_util::{
    client::legacy,
    rt::{TokioExecutor, TokioTimer},
};
use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("synthetic response must be valid")
}

pub struct Proxy {
    rules: ctxforge_rules::RuleSet,
    client: legacy::Client<hyper_util::client::legacy::connect::HttpConnector, Incoming>,
    target_authority: Authority,
    dial_timeout: Duration,
    limiter: RateLimiter,
    metrics: Metrics,
}

impl Proxy {
    pub fn new(cfg: Config, metrics: Metrics) -> Self {
        let mut connector = hyper_util::client::legacy::connect::HttpConnector::new();
        connector.set_connect_timeout(Some(cfg.target_dial_timeout));
        connector.set_nodelay(true);

        // Title-case writing keeps propagated headers in canonical case
        // on the wire.
        let client = legacy::Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.idle_timeout)
            .pool_timer(TokioTimer::new())
            .http1_title_case_headers(true)
            .build(connector);

        Self {
            rules: cfg.rules,
            client,
            target_authority: cfg.target_authority,
            dial_timeout: cfg.target_dial_timeout,
            limiter: RateLimiter::new(
                cfg.rate_limit_enabled,
                cfg.rate_limit_rps,
                cfg.rate_limit_burst,
            ),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn target_authority(&self) -> &Authority {
        &self.target_authority
    }

    /// Handles one request, never failing the connection: panics become
    /// 500s and upstream errors become 502s.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let _in_flight = self.metrics.in_flight();

        let rsp = match AssertUnwindSafe(self.clone().route(req)).catch_unwind().await {
            Ok(rsp) => rsp,
            Err(_panic) => {
                error!("request handler panicked");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };
        Ok(rsp)
    }

    async fn route(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let start = Instant::now();
        let method = req.method().clone();

        if !self.limiter.allow() {
            let rsp = text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            self.metrics
                .record_request(&method, rsp.status(), start.elapsed());
            return rsp;
        }

        if method == Method::CONNECT {
            let rsp = tunnel::serve(req, self.dial_timeout).await;
            self.metrics
                .record_request(&method, rsp.status(), start.elapsed());
            return rsp;
        }

        // Health and metrics are served from the proxy port too, so
        // kubelet probes need no extra wiring. Forward-proxied requests
        // carry an authority and fall through to proxying.
        if req.uri().authority().is_none() && method == Method::GET {
            match req.uri().path() {
                "/healthz" => return crate::admin::healthz(),
                "/ready" => return crate::admin::ready(&self.target_authority).await,
                "/metrics" => return crate::admin::metrics(&self.metrics),
                _ => {}
            }
        }

        let rsp = self.proxy_http(req).await;
        self.metrics
            .record_request(&method, rsp.status(), start.elapsed());
        rsp
    }

    async fn proxy_http(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let eval = self
            .rules
            .evaluate(req.uri().path(), req.method(), req.headers());
        for (name, value) in &eval.generated {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        let scope = RequestScope::new(eval.scope);
        self.metrics.record_headers_propagated(scope.len());
        trace!(scope = scope.len(), "evaluated header rules");
        req.extensions_mut().insert(scope);

        if let Some(authority) = req.uri().authority().cloned() {
            // Forward-proxy role. Only plain HTTP is proxied in the
            // clear; encrypted traffic arrives as CONNECT.
            if req.uri().scheme() != Some(&Scheme::HTTP) {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    "absolute-form target must use http",
                );
            }
            // RFC 7230 §5.4: an absolute-form target replaces Host.
            let host = HeaderValue::from_str(authority.as_str())
                .expect("a valid authority is a valid header value");
            req.headers_mut().insert(header::HOST, host);
        } else {
            // Reverse-proxy role: retarget at the application, keeping
            // the path, query, and original Host.
            let mut parts = Parts::default();
            parts.scheme = Some(Scheme::HTTP);
            parts.authority = Some(self.target_authority.clone());
            parts.path_and_query = req
                .uri()
                .path_and_query()
                .cloned()
                .or_else(|| Some(PathAndQuery::from_static("/")));
            match Uri::from_parts(parts) {
                Ok(uri) => *req.uri_mut() = uri,
                Err(error) => {
                    warn!(%error, "failed to rewrite request target");
                    return text_response(StatusCode::BAD_REQUEST, "invalid request target");
                }
            }
            if !req.headers().contains_key(header::HOST) {
                let host = HeaderValue::from_str(self.target_authority.as_str())
                    .expect("a valid authority is a valid header value");
                req.headers_mut().insert(header::HOST, host);
            }
        }

        self.send(req).await
    }

    /// The outbound send path. The propagation scope is read from the
    /// request being sent and nowhere else; the pooled client below knows
    /// nothing about scopes, so reused connections cannot carry state
    /// between requests.
    async fn send(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        if let Some(scope) = req.extensions().get::<RequestScope>().cloned() {
            let added = scope.apply(req.headers_mut());
            if added > 0 {
                trace!(added, uri = %req.uri(), "injected propagated headers");
            }
        }
        strip_hop_by_hop(req.headers_mut());

        match self.client.request(req).await {
            Ok(rsp) => {
                let mut rsp = rsp.map(BodyExt::boxed);
                strip_hop_by_hop(rsp.headers_mut());
                rsp
            }
            Err(error) => {
                debug!(%error, "upstream request failed");
                text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream request failed: {error}"),
                )
            }
        }
    }
}

/// Hop-by-hop headers named by the Connection header, plus the RFC 7230
/// set, are meant for one connection only and must not be forwarded.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(header::CONNECTION) {
        if let Ok(names) = value.to_str() {
            for name in names.split(',') {
                headers.remove(name.trim());
            }
        }
    }

    for name in [
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}
