//! Sidecar injection: builds the mutated pod for opted-in workloads.

use ctxforge_policy_controller_k8s_api::{
    annotations, Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, IntOrString, Pod,
    Probe, Quantity, ResourceRequirements, SecurityContext, PROXY_CONTAINER_NAME, PROXY_PORT,
};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_PROXY_IMAGE: &str = "ghcr.io/ctxforge/ctxforge-forwarder:latest";
pub const DEFAULT_TARGET_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid ctxforge.io/header-rules annotation: {0}")]
    InvalidRules(#[source] ctxforge_rules::ParseError),

    #[error("invalid ctxforge.io/headers annotation: {0}")]
    InvalidHeaders(#[source] ctxforge_rules::ParseError),
}

/// The declared header configuration, forwarded verbatim to the sidecar.
enum HeaderSource {
    /// JSON rule array from `ctxforge.io/header-rules`.
    Rules(String),
    /// Names from `ctxforge.io/headers`.
    List(Vec<String>),
}

impl HeaderSource {
    fn env(&self) -> EnvVar {
        match self {
            Self::Rules(json) => EnvVar {
                name: "HEADER_RULES".to_string(),
                value: Some(json.clone()),
                ..Default::default()
            },
            Self::List(names) => EnvVar {
                name: "HEADERS_TO_PROPAGATE".to_string(),
                value: Some(names.join(",")),
                ..Default::default()
            },
        }
    }
}

/// Decides whether `pod` should be mutated and, if so, returns the
/// mutated copy. `Ok(None)` admits the pod unchanged; `Err` rejects it.
///
/// Injection happens only when the pod opts in, declares at least one
/// header, and has not been injected before (marker annotation or an
/// existing `ctxforge-proxy` container), so re-submitting an injected
/// pod is a no-op.
pub fn inject(pod: &Pod, proxy_image: &str) -> Result<Option<Pod>, InjectError> {
    let annotations = pod
        .metadata
        .annotations
        .clone()
        .unwrap_or_default();

    if annotations.get(annotations::ENABLED).map(String::as_str) != Some("true") {
        return Ok(None);
    }

    let Some(source) = header_source(&annotations)? else {
        tracing::info!(pod = pod_name(pod), "skipping injection: no headers declared");
        return Ok(None);
    };

    if already_injected(pod, &annotations) {
        tracing::info!(pod = pod_name(pod), "skipping injection: already injected");
        return Ok(None);
    }

    let (target_port, port_warning) = target_port(&annotations);

    let mut pod = pod.clone();
    let spec = pod.spec.get_or_insert_with(Default::default);

    // Point every application container's outbound HTTP(S) traffic at
    // the sidecar.
    for container in spec.containers.iter_mut() {
        container
            .env
            .get_or_insert_with(Vec::new)
            .extend(proxy_env_vars());
    }

    spec.containers.push(sidecar(proxy_image, target_port, &source));

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(annotations::INJECTED.to_string(), "true".to_string());
    if let Some(warning) = port_warning {
        annotations.insert(annotations::TARGET_PORT_WARNING.to_string(), warning);
    }

    Ok(Some(pod))
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
}

fn header_source(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<HeaderSource>, InjectError> {
    if let Some(json) = annotations
        .get(annotations::HEADER_RULES)
        .filter(|v| !v.trim().is_empty())
    {
        let rules = ctxforge_rules::parse_rules(json).map_err(InjectError::InvalidRules)?;
        if rules.is_empty() {
            return Ok(None);
        }
        return Ok(Some(HeaderSource::Rules(json.clone())));
    }

    if let Some(list) = annotations
        .get(annotations::HEADERS)
        .filter(|v| !v.trim().is_empty())
    {
        let rules = ctxforge_rules::parse_list(list).map_err(InjectError::InvalidHeaders)?;
        if rules.is_empty() {
            return Ok(None);
        }
        return Ok(Some(HeaderSource::List(
            rules.into_iter().map(|r| r.name).collect(),
        )));
    }

    Ok(None)
}

fn already_injected(pod: &Pod, annotations: &BTreeMap<String, String>) -> bool {
    if annotations.contains_key(annotations::INJECTED) {
        return true;
    }
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .any(|c| c.name == PROXY_CONTAINER_NAME)
        })
        .unwrap_or(false)
}

/// Resolves the application port the sidecar forwards to. Unusable
/// values fall back to the default, recorded in a warning annotation.
fn target_port(annotations: &BTreeMap<String, String>) -> (u16, Option<String>) {
    let Some(declared) = annotations
        .get(annotations::TARGET_PORT)
        .filter(|v| !v.trim().is_empty())
    else {
        return (DEFAULT_TARGET_PORT, None);
    };

    match declared.trim().parse::<u16>() {
        Ok(port) if port >= 1 && port != PROXY_PORT => (port, None),
        _ => (
            DEFAULT_TARGET_PORT,
            Some(format!(
                "invalid target-port {declared:?} (must be 1-65535 and not {PROXY_PORT}); using {DEFAULT_TARGET_PORT}"
            )),
        ),
    }
}

fn proxy_env_vars() -> Vec<EnvVar> {
    let proxy_url = format!("http://localhost:{PROXY_PORT}");
    vec![
        EnvVar {
            name: "HTTP_PROXY".to_string(),
            value: Some(proxy_url.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "HTTPS_PROXY".to_string(),
            value: Some(proxy_url),
            ..Default::default()
        },
        EnvVar {
            name: "NO_PROXY".to_string(),
            value: Some("localhost,127.0.0.1".to_string()),
            ..Default::default()
        },
    ]
}

fn sidecar(image: &str, target_port: u16, source: &HeaderSource) -> Container {
    let resources = |memory: &str, cpu: &str| -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert("memory".to_string(), Quantity(memory.to_string()));
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
        map
    };

    Container {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: i32::from(PROXY_PORT),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            source.env(),
            EnvVar {
                name: "TARGET_HOST".to_string(),
                value: Some(format!("localhost:{target_port}")),
                ..Default::default()
            },
            EnvVar {
                name: "PROXY_PORT".to_string(),
                value: Some(PROXY_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "LOG_LEVEL".to_string(),
                value: Some("info".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "LOG_FORMAT".to_string(),
                value: Some("json".to_string()),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(resources("10Mi", "10m")),
            limits: Some(resources("50Mi", "100m")),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(65532),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(i32::from(PROXY_PORT)),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(i32::from(PROXY_PORT)),
                ..Default::default()
            }),
            initial_delay_seconds: Some(3),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}
