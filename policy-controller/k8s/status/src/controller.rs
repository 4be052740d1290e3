use crate::ResourceId;
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use chrono::Utc;
use ctxforge_policy_controller_k8s_api::{
    self as k8s, labels, Condition, HeaderPropagationPolicy, HeaderPropagationPolicyStatus,
    Selector, Time, PROXY_CONTAINER_NAME,
};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Re-check interval while matching pods are still Pending.
const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Safety-net interval when nothing matches at all.
const EMPTY_REQUEUE: Duration = Duration::from_secs(30);

const MAX_BACKOFF: Duration = Duration::from_secs(300);

const CONDITION_READY: &str = "Ready";

pub struct Controller {
    client: k8s::Client,
    reconcile: UnboundedSender<ResourceId>,
    requests: UnboundedReceiver<ResourceId>,

    /// Consecutive failures per policy, for exponential backoff.
    failures: HashMap<ResourceId, u32>,
}

/// What reconciliation observed about a policy's pods.
enum Observation {
    Counted(PodCounts),
    InvalidSelector(String),
    ListFailed(String),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct PodCounts {
    running: i32,
    pending: i32,
}

impl Controller {
    pub fn new(
        client: k8s::Client,
        reconcile: UnboundedSender<ResourceId>,
        requests: UnboundedReceiver<ResourceId>,
    ) -> Self {
        Self {
            client,
            reconcile,
            requests,
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(id) = self.requests.recv().await {
            match self.reconcile(&id).await {
                Ok(requeue) => {
                    self.failures.remove(&id);
                    if let Some(delay) = requeue {
                        self.requeue_after(id, delay);
                    }
                }
                Err(error) => {
                    let attempts = self.failures.entry(id.clone()).or_insert(0);
                    *attempts += 1;
                    let delay = backoff(*attempts);
                    warn!(%id, %error, ?delay, "reconciliation failed");
                    self.requeue_after(id, delay);
                }
            }
        }
    }

    fn requeue_after(&self, id: ResourceId, delay: Duration) {
        let reconcile = self.reconcile.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = reconcile.send(id);
        });
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Option<Duration>> {
        let policies: k8s::Api<HeaderPropagationPolicy> =
            k8s::Api::namespaced(self.client.clone(), &id.namespace);

        let Some(policy) = policies.get_opt(&id.name).await? else {
            debug!(%id, "policy is gone");
            return Ok(None);
        };

        let observation = match Selector::from_label_selector(policy.spec.pod_selector.as_ref()) {
            Ok(selector) => {
                let pods: k8s::Api<k8s::Pod> =
                    k8s::Api::namespaced(self.client.clone(), &id.namespace);
                match pods.list(&k8s::ListParams::default()).await {
                    Ok(list) => Observation::Counted(count_pods(&selector, &list.items)),
                    Err(error) => Observation::ListFailed(error.to_string()),
                }
            }
            Err(error) => Observation::InvalidSelector(error.to_string()),
        };

        let status = build_status(&policy, &observation);
        if policy.status.as_ref() != Some(&status) {
            let patch = serde_json::json!({
                "apiVersion": "ctxforge.io/v1alpha1",
                "kind": "HeaderPropagationPolicy",
                "status": &status,
            });
            policies
                .patch_status(
                    &id.name,
                    &k8s::PatchParams::default(),
                    &k8s::Patch::Merge(patch),
                )
                .await?;
            info!(%id, applied_to_pods = status.applied_to_pods, "status updated");
        }

        match observation {
            Observation::Counted(counts) => Ok(requeue(&counts)),
            // A broken selector only changes with the policy itself; the
            // policy watch re-triggers reconciliation then.
            Observation::InvalidSelector(_) => Ok(None),
            Observation::ListFailed(error) => bail!("failed to list pods: {error}"),
        }
    }
}

fn backoff(attempts: u32) -> Duration {
    Duration::from_secs(1u64 << attempts.min(9)).min(MAX_BACKOFF)
}

fn requeue(counts: &PodCounts) -> Option<Duration> {
    if counts.pending > 0 {
        Some(PENDING_REQUEUE)
    } else if counts.running == 0 {
        Some(EMPTY_REQUEUE)
    } else {
        None
    }
}

fn has_sidecar(pod: &k8s::Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .any(|c| c.name == PROXY_CONTAINER_NAME)
        })
        .unwrap_or(false)
}

fn count_pods(selector: &Selector, pods: &[k8s::Pod]) -> PodCounts {
    let mut counts = PodCounts::default();
    for pod in pods {
        let pod_labels: labels::Map = pod.metadata.labels.clone().unwrap_or_default();
        if !selector.matches(&pod_labels) || !has_sidecar(pod) {
            continue;
        }
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => counts.running += 1,
            Some("Pending") => counts.pending += 1,
            _ => {}
        }
    }
    counts
}

fn build_status(
    policy: &HeaderPropagationPolicy,
    observation: &Observation,
) -> HeaderPropagationPolicyStatus {
    let generation = policy.metadata.generation;

    let (applied, status, reason, message) = match observation {
        Observation::Counted(counts) if counts.running > 0 => (
            counts.running,
            "True",
            "PolicyApplied",
            format!(
                "policy is applied to {} running pod(s) with the {PROXY_CONTAINER_NAME} sidecar",
                counts.running
            ),
        ),
        Observation::Counted(_) => (
            0,
            "False",
            "NoMatchingPods",
            format!("no running pods with the {PROXY_CONTAINER_NAME} sidecar match the selector"),
        ),
        Observation::InvalidSelector(error) => (
            0,
            "False",
            "InvalidSelector",
            format!("failed to parse podSelector: {error}"),
        ),
        Observation::ListFailed(error) => (
            0,
            "False",
            "ListPodsFailed",
            format!("failed to list pods: {error}"),
        ),
    };

    // Keep the previous transition time when the condition itself has
    // not flipped.
    let last_transition_time = policy
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == CONDITION_READY))
        .filter(|c| c.status == status && c.reason == reason)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Time(Utc::now()));

    HeaderPropagationPolicyStatus {
        conditions: vec![Condition {
            last_transition_time,
            message,
            observed_generation: generation,
            reason: reason.to_string(),
            status: status.to_string(),
            type_: CONDITION_READY.to_string(),
        }],
        observed_generation: generation,
        applied_to_pods: applied,
    }
}
