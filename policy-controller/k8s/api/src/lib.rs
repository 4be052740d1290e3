#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::labels::Selector;
pub use self::policy::{
    HeaderConfig, HeaderPropagationPolicy, HeaderPropagationPolicySpec,
    HeaderPropagationPolicyStatus, PropagationRule,
};
pub use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodSpec, PodStatus,
        Probe, ResourceRequirements, SecurityContext,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{Condition, LabelSelector, Time},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    Client, Error,
};

/// Name of the injected sidecar container. A pod already carrying a
/// container by this name is never injected again.
pub const PROXY_CONTAINER_NAME: &str = "ctxforge-proxy";

/// Port the forwarder listens on inside the pod.
pub const PROXY_PORT: u16 = 9090;

/// Workload annotations consumed and produced by the injector.
pub mod annotations {
    /// Opt-in: literal `"true"` enables injection.
    pub const ENABLED: &str = "ctxforge.io/enabled";

    /// Comma-separated header names (simple mode).
    pub const HEADERS: &str = "ctxforge.io/headers";

    /// JSON rule array (structured mode); overrides `HEADERS`.
    pub const HEADER_RULES: &str = "ctxforge.io/header-rules";

    /// The application's listening port; defaults to 8080.
    pub const TARGET_PORT: &str = "ctxforge.io/target-port";

    /// Set by the injector once a pod has been mutated.
    pub const INJECTED: &str = "ctxforge.io/injected";

    /// Set by the injector when a declared target port was unusable and
    /// the default was applied instead.
    pub const TARGET_PORT_WARNING: &str = "ctxforge.io/target-port-warning";
}

/// Namespace-scope opt-in label. Advisory in the current design: the
/// per-pod annotation remains authoritative for the injection decision.
pub const INJECTION_LABEL: &str = "ctxforge.io/injection";
pub const INJECTION_LABEL_ENABLED: &str = "enabled";
