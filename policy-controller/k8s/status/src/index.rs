use crate::ResourceId;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ctxforge_policy_controller_k8s_api::{self as k8s, HeaderPropagationPolicy, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Maps watch events to the policies that must be re-reconciled. Pod
/// events are coarse: any pod change re-reconciles every policy in the
/// pod's namespace, which is cheap because reconciliation only counts.
pub struct Index {
    reconcile: UnboundedSender<ResourceId>,

    /// Known policy names, by namespace.
    policies: HashMap<String, HashSet<String>>,
}

impl Index {
    pub fn shared(reconcile: UnboundedSender<ResourceId>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            reconcile,
            policies: HashMap::new(),
        }))
    }

    fn reconcile_namespace(&self, namespace: &str) {
        for name in self.policies.get(namespace).into_iter().flatten() {
            let _ = self
                .reconcile
                .send(ResourceId::new(namespace.to_string(), name.clone()));
        }
    }
}

impl kubert::index::IndexNamespacedResource<HeaderPropagationPolicy> for Index {
    fn apply(&mut self, policy: HeaderPropagationPolicy) {
        let namespace = policy
            .namespace()
            .expect("HeaderPropagationPolicy is namespaced");
        let name = policy.name_unchecked();
        tracing::debug!(%namespace, %name, "policy updated");

        self.policies
            .entry(namespace.clone())
            .or_default()
            .insert(name.clone());
        let _ = self.reconcile.send(ResourceId::new(namespace, name));
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::debug!(%namespace, %name, "policy deleted");
        if let Some(names) = self.policies.get_mut(&namespace) {
            names.remove(&name);
            if names.is_empty() {
                self.policies.remove(&namespace);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        if let Some(namespace) = pod.namespace() {
            self.reconcile_namespace(&namespace);
        }
    }

    fn delete(&mut self, namespace: String, _name: String) {
        self.reconcile_namespace(&namespace);
    }
}
