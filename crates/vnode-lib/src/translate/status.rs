//! Container and pod status derived from observed biz state

use super::biz::identity_of;
use crate::models::{ArkBizInfo, BizModel, BizState};
use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub const REASON_BIZ_PENDING: &str = "BizPending";
pub const REASON_BIZ_RESOLVED: &str = "BizResolved";
pub const REASON_BIZ_DEACTIVATED: &str = "BizDeactivated";

const POD_PHASE_PENDING: &str = "Pending";
const POD_PHASE_RUNNING: &str = "Running";
const POD_PHASE_FAILED: &str = "Failed";

/// Container status for a desired module given what the remote side reported.
///
/// Depends only on the current observation: no history, no transition table.
pub fn biz_info_to_container_status(
    model: &BizModel,
    info: Option<&ArkBizInfo>,
) -> ContainerStatus {
    biz_info_to_container_status_at(model, info, Utc::now())
}

/// Same as [`biz_info_to_container_status`] with an explicit instant for the
/// running start time or termination time.
///
/// `since` is kept to whole seconds, the precision the API server stores.
pub fn biz_info_to_container_status_at(
    model: &BizModel,
    info: Option<&ArkBizInfo>,
    since: DateTime<Utc>,
) -> ContainerStatus {
    let since = since.trunc_subsecs(0);
    let (state, ready) = match info.map(|i| &i.state) {
        None => (waiting(REASON_BIZ_PENDING, "biz is not installed yet"), false),
        Some(BizState::Resolved) => (
            waiting(REASON_BIZ_RESOLVED, "biz is resolved, waiting for activation"),
            false,
        ),
        Some(BizState::Activated) => (
            ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(Time(since)),
                }),
                ..Default::default()
            },
            true,
        ),
        Some(BizState::Deactivated) => (
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 0,
                    reason: Some(REASON_BIZ_DEACTIVATED.to_string()),
                    message: Some("biz has been deactivated".to_string()),
                    finished_at: Some(Time(since)),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        ),
        Some(BizState::Other(raw)) => (
            waiting(raw, &format!("unrecognised biz state {raw}")),
            false,
        ),
    };

    ContainerStatus {
        name: model.name.clone(),
        image: model.url.clone(),
        image_id: model.url.clone(),
        container_id: Some(format!("biz://{}", identity_of(model))),
        ready,
        started: Some(ready),
        restart_count: 0,
        state: Some(state),
        ..Default::default()
    }
}

fn waiting(reason: &str, message: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
        ..Default::default()
    }
}

fn is_running(status: &ContainerStatus) -> bool {
    status.state.as_ref().is_some_and(|s| s.running.is_some())
}

fn is_terminated(status: &ContainerStatus) -> bool {
    status.state.as_ref().is_some_and(|s| s.terminated.is_some())
}

/// Any Terminated container fails the pod; all Running means Running; else Pending
pub fn pod_phase(statuses: &[ContainerStatus]) -> &'static str {
    if statuses.iter().any(is_terminated) {
        POD_PHASE_FAILED
    } else if !statuses.is_empty() && statuses.iter().all(is_running) {
        POD_PHASE_RUNNING
    } else {
        POD_PHASE_PENDING
    }
}

/// Full pod status from container statuses.
///
/// Conditions carry no timestamps so two builds from the same observations
/// compare equal.
pub fn build_pod_status(pod: &Pod, statuses: Vec<ContainerStatus>, node_ip: &str) -> PodStatus {
    let phase = pod_phase(&statuses);
    let all_ready = !statuses.is_empty() && statuses.iter().all(|s| s.ready);
    let start_time = pod
        .status
        .as_ref()
        .and_then(|s| s.start_time.clone())
        .or_else(|| {
            statuses
                .iter()
                .filter_map(|s| s.state.as_ref()?.running.as_ref()?.started_at.clone())
                .min_by_key(|t| t.0)
        });
    let node_ip = (!node_ip.is_empty()).then(|| node_ip.to_string());

    PodStatus {
        phase: Some(phase.to_string()),
        conditions: Some(vec![
            condition("PodScheduled", true),
            condition("Initialized", true),
            condition("ContainersReady", all_ready),
            condition("Ready", all_ready),
        ]),
        container_statuses: Some(statuses),
        host_ip: node_ip.clone(),
        pod_ip: node_ip,
        start_time,
        ..Default::default()
    }
}

fn condition(type_: &str, value: bool) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if value { "True" } else { "False" }.to_string(),
        ..Default::default()
    }
}
