//! The pod admission service.
//!
//! One HTTPS endpoint, two paths: POST `/mutate` injects the forwarder
//! sidecar into opted-in pods; POST `/validate` checks the annotations
//! on pod creation, warning (not rejecting) when a pod opts in without
//! declaring headers.

use crate::inject;
use bytes::Bytes;
use ctxforge_policy_controller_k8s_api::{annotations, Pod};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::{body::Incoming, header, Method, Request, Response, StatusCode};
use kube::core::{admission, DynamicObject};
use std::convert::Infallible;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;
type AdmissionReview = admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<Bytes>;

#[derive(Clone)]
pub struct Admission {
    proxy_image: String,
}

/// The two webhook registrations this service backs.
#[derive(Copy, Clone, Debug)]
enum Endpoint {
    Mutate,
    Validate,
}

impl Endpoint {
    fn route<B>(req: &Request<B>) -> Option<Self> {
        if req.method() != Method::POST {
            return None;
        }
        match req.uri().path() {
            "/mutate" => Some(Self::Mutate),
            "/validate" => Some(Self::Validate),
            _ => None,
        }
    }
}

// === impl Admission ===

impl tower::Service<Request<Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let admission = self.clone();
        Box::pin(async move { Ok(admission.handle(req).await) })
    }
}

impl Admission {
    pub fn new(proxy_image: String) -> Self {
        Self { proxy_image }
    }

    /// Serves one webhook call. Every failure mode is expressed in the
    /// response: unknown routes 404, unreadable bodies 400, and
    /// anything review-shaped comes back as an AdmissionReview.
    async fn handle(self, req: Request<Incoming>) -> Response<Body> {
        let Some(endpoint) = Endpoint::route(&req) else {
            return plain_response(StatusCode::NOT_FOUND);
        };

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                warn!(%error, "failed to read admission request body");
                return plain_response(StatusCode::BAD_REQUEST);
            }
        };

        review_response(self.review(endpoint, &body))
    }

    /// Runs the endpoint against a serialized AdmissionReview.
    fn review(&self, endpoint: Endpoint, body: &[u8]) -> AdmissionReview {
        let review: AdmissionReview = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "malformed admission review");
                return AdmissionResponse::invalid(error).into_review();
            }
        };

        let req: AdmissionRequest = match review.try_into() {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "invalid admission request");
                return AdmissionResponse::invalid(error).into_review();
            }
        };
        debug!(?endpoint, operation = ?req.operation, name = %req.name, namespace = ?req.namespace, "admission request");

        let rsp = match endpoint {
            Endpoint::Mutate => self.mutate(req),
            Endpoint::Validate => self.validate(req),
        };
        rsp.into_review()
    }

    /// Builds the mutation response: a JSON patch when the pod is
    /// injected, a plain allow when it passes through, a denial when its
    /// header configuration cannot be parsed.
    fn mutate(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let Some(obj) = req.object else {
            return AdmissionResponse::invalid("admission request has no object");
        };
        let pod = match parse_pod(&obj) {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, "failed to deserialize pod");
                return AdmissionResponse::invalid(error);
            }
        };

        match inject::inject(&pod, &self.proxy_image) {
            Ok(Some(mutated)) => {
                let patch = match pod_patch(&pod, &mutated) {
                    Ok(patch) => patch,
                    Err(error) => return AdmissionResponse::invalid(error),
                };
                info!(
                    namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    "injecting sidecar",
                );
                match rsp.with_patch(patch) {
                    Ok(rsp) => rsp,
                    Err(error) => AdmissionResponse::invalid(error),
                }
            }
            Ok(None) => rsp,
            Err(error) => {
                info!(%error, "denied");
                rsp.deny(error.to_string())
            }
        }
    }

    /// Validates pod creation. Updates pass through untouched: injected
    /// pods already carry the idempotence marker and are never
    /// re-validated.
    fn validate(&self, req: AdmissionRequest) -> AdmissionResponse {
        let mut rsp = AdmissionResponse::from(&req);
        if req.operation != admission::Operation::Create {
            return rsp;
        }

        let Some(obj) = req.object else {
            return AdmissionResponse::invalid("admission request has no object");
        };
        let pod = match parse_pod(&obj) {
            Ok(pod) => pod,
            Err(error) => return AdmissionResponse::invalid(error),
        };

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        if annotations.get(annotations::ENABLED).map(String::as_str) != Some("true") {
            return rsp;
        }

        if let Some(rules) = annotations
            .get(annotations::HEADER_RULES)
            .filter(|v| !v.trim().is_empty())
        {
            if let Err(error) = ctxforge_rules::parse_rules(rules) {
                return rsp.deny(format!("invalid {}: {error}", annotations::HEADER_RULES));
            }
            return rsp;
        }

        match annotations.get(annotations::HEADERS) {
            Some(headers) if !headers.trim().is_empty() => {
                match ctxforge_rules::parse_list(headers) {
                    Ok(parsed) if !parsed.is_empty() => rsp,
                    Ok(_) => {
                        rsp.warnings = Some(vec![no_headers_warning()]);
                        rsp
                    }
                    Err(error) => rsp.deny(format!("invalid {}: {error}", annotations::HEADERS)),
                }
            }
            _ => {
                rsp.warnings = Some(vec![no_headers_warning()]);
                rsp
            }
        }
    }
}

fn plain_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("status-only response must be valid")
}

fn review_response(review: AdmissionReview) -> Response<Body> {
    match serde_json::to_vec(&review) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::new(bytes.into()))
            .expect("review response must be valid"),
        Err(error) => {
            // An AdmissionReview is plain data; failing to encode one
            // means a bug, not a bad request.
            warn!(%error, "failed to encode admission review");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn no_headers_warning() -> String {
    format!(
        "{} is set but no headers are declared in {} or {}",
        annotations::ENABLED,
        annotations::HEADERS,
        annotations::HEADER_RULES,
    )
}

fn parse_pod(obj: &DynamicObject) -> Result<Pod, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

fn pod_patch(original: &Pod, mutated: &Pod) -> Result<json_patch::Patch, serde_json::Error> {
    Ok(json_patch::diff(
        &serde_json::to_value(original)?,
        &serde_json::to_value(mutated)?,
    ))
}
