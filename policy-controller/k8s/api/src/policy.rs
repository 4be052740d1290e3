use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a set of headers that must flow across service-to-service
/// calls for the selected pods.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ctxforge.io",
    version = "v1alpha1",
    kind = "HeaderPropagationPolicy",
    status = "HeaderPropagationPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPropagationPolicySpec {
    /// Selects the pods this policy applies to. Absent selects all pods
    /// in the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    pub propagation_rules: Vec<PropagationRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PropagationRule {
    pub headers: Vec<HeaderConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub generate: bool,

    /// One of `uuid`, `ulid`, or `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_type: Option<String>,

    /// Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagate: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPropagationPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Running pods carrying the forwarder that match the selector.
    #[serde(default)]
    pub applied_to_pods: i32,
}
