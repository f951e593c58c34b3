//! Desired pods vs. installed modules, and pod status write-back

use super::Inner;
use crate::error::Error;
use crate::health::components;
use crate::models::{BizModel, BizState};
use crate::translate::{
    biz_info_to_container_status_at, build_pod_status, cmp_biz_model, identity_of, pod_key,
    pod_to_biz_models,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Install,
    Uninstall,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Command::Install => "install",
            Command::Uninstall => "uninstall",
        }
    }
}

/// State owned by the reconcile task alone
#[derive(Debug, Default)]
struct ReconcileState {
    /// Modules whose install command the broker accepted, per pod key
    installed: HashMap<String, Vec<BizModel>>,
    /// Pods from the last successful listing, minus those being deleted
    pods: HashMap<String, Pod>,
    /// Last status written per pod key
    last_status: HashMap<String, PodStatus>,
    cluster_failures: u32,
}

/// Pod keys that still want each module identity, from the current listing
type Wanted = HashMap<String, HashSet<String>>;

pub(crate) async fn run(inner: Arc<Inner>, stop: CancellationToken) {
    let mut ticker = interval(inner.config.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = ReconcileState::default();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = reconcile(&inner, &mut state, &stop) => {}
                }
            }
            // A biz state changed; statuses only, against the cached pods
            _ = inner.inbound.dirty.notified() => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = push_statuses(&inner, &mut state) => {}
                }
            }
        }
    }
}

/// One full pass: list pods, install/uninstall, then push statuses
async fn reconcile(inner: &Inner, state: &mut ReconcileState, stop: &CancellationToken) {
    let started = Instant::now();
    inner.ensure_subscribed().await;

    let pods = match inner
        .bounded("list pods", inner.cluster.list_pods_on_node(&inner.node_name))
        .await
    {
        Ok(pods) => {
            state.cluster_failures = 0;
            inner.health.set_healthy(components::CLUSTER).await;
            pods
        }
        Err(e) => {
            state.cluster_failures += 1;
            warn!(
                failures = state.cluster_failures,
                max = inner.config.max_cluster_failures,
                error = %e,
                "Failed to list pods"
            );
            if state.cluster_failures >= inner.config.max_cluster_failures {
                inner
                    .health
                    .set_unhealthy(components::CLUSTER, e.to_string())
                    .await;
                let err = match e {
                    Error::ClusterAccess(_) => e,
                    other => Error::cluster_access(other.to_string()),
                };
                inner.fail(err, stop);
            } else {
                inner
                    .health
                    .set_degraded(components::CLUSTER, e.to_string())
                    .await;
            }
            return;
        }
    };
    inner.metrics.set_pods_managed(pods.len() as i64);

    let mut wanted = Wanted::new();
    for pod in pods.iter().filter(|p| p.metadata.deletion_timestamp.is_none()) {
        let key = pod_key(pod);
        for model in pod_to_biz_models(pod) {
            wanted.entry(identity_of(&model)).or_default().insert(key.clone());
        }
    }

    let mut listed = HashMap::with_capacity(pods.len());
    for pod in pods {
        let key = pod_key(&pod);
        if pod.metadata.deletion_timestamp.is_some() {
            state.last_status.remove(&key);
            if uninstall_all(inner, state, &wanted, &key).await {
                delete_pod(inner, &pod).await;
            }
            continue;
        }
        sync_modules(inner, state, &wanted, &key, pod_to_biz_models(&pod)).await;
        listed.insert(key, pod);
    }

    let vanished: Vec<String> = state
        .installed
        .keys()
        .filter(|key| !listed.contains_key(*key))
        .cloned()
        .collect();
    for key in vanished {
        debug!(pod = %key, "Pod no longer bound to node");
        state.last_status.remove(&key);
        uninstall_all(inner, state, &wanted, &key).await;
    }

    state.pods = listed;
    push_statuses(inner, state).await;
    inner
        .metrics
        .observe_reconcile_latency(started.elapsed().as_secs_f64());
}

/// Bring one pod's installed modules in line with its containers
async fn sync_modules(
    inner: &Inner,
    state: &mut ReconcileState,
    wanted: &Wanted,
    key: &str,
    desired: Vec<BizModel>,
) {
    let previous = state.installed.remove(key).unwrap_or_default();
    let mut installed = Vec::with_capacity(desired.len());

    for model in previous {
        if desired.iter().any(|d| cmp_biz_model(d, &model)) {
            installed.push(model);
        } else if !release(inner, state, wanted, key, &model).await {
            // Retried next pass
            installed.push(model);
        }
    }

    for model in desired {
        if installed.iter().any(|m| cmp_biz_model(m, &model)) {
            continue;
        }
        if already_running(inner, &model)
            || installed_elsewhere(state, key, &model)
            || publish_command(inner, Command::Install, key, &model).await
        {
            installed.push(model);
        }
    }

    if !installed.is_empty() {
        state.installed.insert(key.to_string(), installed);
    }
}

/// The base already reports the module, e.g. after a controller restart
fn already_running(inner: &Inner, model: &BizModel) -> bool {
    inner
        .inbound
        .store
        .get(&identity_of(model))
        .is_some_and(|record| record.info.state != BizState::Deactivated)
}

/// Another pod's install of the same module already went out
fn installed_elsewhere(state: &ReconcileState, key: &str, model: &BizModel) -> bool {
    state
        .installed
        .iter()
        .any(|(other, models)| other != key && models.iter().any(|m| cmp_biz_model(m, model)))
}

/// Drop the pod's claim on a module, uninstalling it only when no other pod
/// wants or holds it. False when the uninstall could not be delivered.
async fn release(
    inner: &Inner,
    state: &ReconcileState,
    wanted: &Wanted,
    key: &str,
    model: &BizModel,
) -> bool {
    let identity = identity_of(model);
    let wanted_elsewhere = wanted
        .get(&identity)
        .is_some_and(|keys| keys.iter().any(|other| other != key));
    if wanted_elsewhere || installed_elsewhere(state, key, model) {
        debug!(pod = %key, biz = %identity, "Module still used by another pod, not uninstalling");
        return true;
    }

    if publish_command(inner, Command::Uninstall, key, model).await {
        inner.inbound.store.remove(&identity);
        true
    } else {
        false
    }
}

/// Release every module recorded for the pod; true when none remain
async fn uninstall_all(inner: &Inner, state: &mut ReconcileState, wanted: &Wanted, key: &str) -> bool {
    let Some(models) = state.installed.remove(key) else {
        return true;
    };

    let mut remaining = Vec::new();
    for model in models {
        if !release(inner, state, wanted, key, &model).await {
            remaining.push(model);
        }
    }

    if remaining.is_empty() {
        true
    } else {
        state.installed.insert(key.to_string(), remaining);
        false
    }
}

async fn publish_command(inner: &Inner, command: Command, key: &str, model: &BizModel) -> bool {
    let topic = match command {
        Command::Install => inner.topics.install_biz(),
        Command::Uninstall => inner.topics.uninstall_biz(),
    };
    let payload = match serde_json::to_vec(model) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode biz command");
            return false;
        }
    };

    let result = inner
        .transport
        .publish_with_timeout(
            &topic,
            inner.config.command_qos,
            false,
            payload,
            inner.config.operation_timeout,
        )
        .await;
    inner.health.record(components::TRANSPORT, &result).await;

    match result {
        Ok(()) => {
            inner.metrics.inc_command_published(command.as_str());
            inner
                .logger
                .log_command(command.as_str(), key, &identity_of(model));
            true
        }
        Err(e) => {
            inner.metrics.inc_transport_failure(command.as_str());
            warn!(
                pod = %key,
                biz = %identity_of(model),
                command = command.as_str(),
                error = %e,
                "Biz command not delivered, retrying next pass"
            );
            false
        }
    }
}

async fn delete_pod(inner: &Inner, pod: &Pod) {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    match inner
        .bounded("delete pod", inner.cluster.delete_pod(namespace, name))
        .await
    {
        Ok(()) => debug!(pod = %pod_key(pod), "Deleted terminating pod"),
        Err(e) => warn!(pod = %pod_key(pod), error = %e, "Failed to delete pod"),
    }
}

/// Write the status of every cached pod whose derived status changed
async fn push_statuses(inner: &Inner, state: &mut ReconcileState) {
    for (key, pod) in &state.pods {
        let statuses = pod_to_biz_models(pod)
            .iter()
            .map(|model| {
                let record = inner.inbound.store.get(&identity_of(model));
                let since = record.as_ref().map(|r| r.since).unwrap_or_else(Utc::now);
                biz_info_to_container_status_at(model, record.as_ref().map(|r| &r.info), since)
            })
            .collect();
        let status = build_pod_status(pod, statuses, &inner.config.node.node_ip);

        if state.last_status.get(key) == Some(&status) {
            continue;
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        match inner
            .bounded("update pod status", inner.cluster.update_pod_status(namespace, name, &status))
            .await
        {
            Ok(()) => {
                debug!(pod = %key, phase = ?status.phase, "Pod status updated");
                state.last_status.insert(key.clone(), status);
            }
            Err(e) => {
                warn!(pod = %key, error = %e, "Failed to update pod status");
                inner
                    .health
                    .set_degraded(components::CLUSTER, e.to_string())
                    .await;
            }
        }
    }
}
