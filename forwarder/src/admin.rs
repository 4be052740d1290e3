//! Health, readiness, and metrics endpoints.
//!
//! These are served from the proxy listener (so the injector can point
//! kubelet probes at the proxy port) and, for `/metrics` and `/healthz`,
//! from a dedicated metrics listener so scrapes stay off the data path.

use crate::{
    metrics::Metrics,
    proxy::{empty, ProxyBody},
};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::{header, uri::Authority, Method, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{convert::Infallible, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How long a readiness check waits for a TCP connection to the target.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    let bytes = serde_json::to_vec(&body).expect("health body must encode");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(bytes))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("health response must be valid")
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Liveness: unconditionally healthy while the listener is serving.
pub(crate) fn healthz() -> Response<ProxyBody> {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "timestamp": timestamp(),
        }),
    )
}

/// Readiness: healthy only when a fresh TCP connection to the target
/// application succeeds within the probe timeout.
pub(crate) async fn ready(target: &Authority) -> Response<ProxyBody> {
    let reachable = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target.as_str())).await,
        Ok(Ok(_))
    );
    if !reachable {
        debug!(target = %target, "target not reachable");
    }

    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        serde_json::json!({
            "status": if reachable { "ready" } else { "not_ready" },
            "targetHost": target.as_str(),
            "targetReachable": reachable,
            "timestamp": timestamp(),
        }),
    )
}

pub(crate) fn metrics(metrics: &Metrics) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(
            Full::new(Bytes::from(metrics.encode()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("metrics response must be valid")
}

/// Serves the standalone metrics listener until shutdown.
pub(crate) async fn serve(listener: TcpListener, registry: Metrics, shutdown: drain::Watch) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics server listening");
    }

    loop {
        let stream = tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, _peer)) => stream,
                Err(error) => {
                    warn!(%error, "failed to accept metrics connection");
                    continue;
                }
            },
            _ = shutdown.clone().signaled() => break,
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move {
                    let rsp = match (req.method(), req.uri().path()) {
                        (&Method::GET, "/metrics") => metrics(&registry),
                        (&Method::GET, "/healthz") => healthz(),
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(empty())
                            .expect("not found response must be valid"),
                    };
                    Ok::<_, Infallible>(rsp)
                }
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(TokioIo::new(stream), svc);
            if let Err(error) = conn.await {
                debug!(%error, "metrics connection closed");
            }
        });
    }
}
