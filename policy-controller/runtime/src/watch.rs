//! Turns pod watch events into configuration passes.

use crate::{
    k8s::{Pod, ResourceExt, Time},
    queue::Submitter,
    reconcile::{Key, Trigger},
};
use k8s_openapi::chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

pub type SharedPodEvents = Arc<RwLock<PodEvents>>;

/// Submits a configuration pass for every pod created after the controller
/// started and for every pod whose generation changes.
///
/// Pods that already existed at startup are remembered but not reconciled
/// until they change.
pub struct PodEvents {
    queue: Submitter,
    started: DateTime<Utc>,
    system_namespace: String,
    generations: HashMap<Key, Option<i64>>,
}

// === impl PodEvents ===

impl PodEvents {
    pub fn shared(
        queue: Submitter,
        started: Time,
        system_namespace: impl ToString,
    ) -> SharedPodEvents {
        Arc::new(RwLock::new(Self {
            queue,
            started: started.0,
            system_namespace: system_namespace.to_string(),
            generations: HashMap::default(),
        }))
    }

    fn is_new(&self, pod: &Pod) -> bool {
        pod.metadata
            .creation_timestamp
            .as_ref()
            .map_or(false, |Time(created)| *created > self.started)
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for PodEvents {
    fn apply(&mut self, pod: Pod) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        if namespace == self.system_namespace {
            return;
        }
        let key = Key {
            namespace,
            name: pod.name_unchecked(),
        };
        let generation = pod.metadata.generation;

        let changed = match self.generations.insert(key.clone(), generation) {
            None => self.is_new(&pod),
            Some(previous) => previous != generation,
        };
        if !changed {
            return;
        }

        debug!(%key, ?generation, "Pod changed");
        let trigger = Trigger::Config {
            namespace: key.namespace,
            name: key.name,
        };
        if let Err(error) = self.queue.enqueue(trigger) {
            warn!(%error, "Dropping pod event");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.generations.remove(&Key { namespace, name });
    }
}
