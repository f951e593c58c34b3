//! Virtual node construction

use crate::models::BuildVirtualNodeConfig;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Node, NodeAddress, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;

/// Taint that keeps ordinary workloads off the virtual node
pub const VIRTUAL_NODE_TAINT_KEY: &str = "schedule.koupleless.io/virtual-node";
const VIRTUAL_NODE_TAINT_VALUE: &str = "True";
const VIRTUAL_NODE_TAINT_EFFECT: &str = "NoExecute";

pub const LABEL_BASE_NAME: &str = "base.koupleless.io/name";
pub const LABEL_TECH_STACK: &str = "base.koupleless.io/stack";
pub const LABEL_BASE_VERSION: &str = "base.koupleless.io/version";
const LABEL_NODE_TYPE: &str = "type";
const LABEL_NODE_ROLE: &str = "kubernetes.io/role";

pub const NODE_PHASE_PENDING: &str = "Pending";
pub const NODE_PHASE_RUNNING: &str = "Running";

const CONDITION_READY: &str = "Ready";
const REASON_BASE_READY: &str = "BaseReady";
const REASON_BASE_NOT_READY: &str = "BaseNotReady";

/// Node name for a node id: `vnode-<id>`, lowercased, invalid characters replaced
pub fn virtual_node_name(node_id: &str) -> String {
    let sanitized: String = node_id
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c| c == '-' || c == '.');

    if sanitized.is_empty() {
        "vnode".to_string()
    } else {
        format!("vnode-{}", sanitized)
    }
}

/// Populate a Node from the config.
///
/// The result always carries exactly one taint and phase `Pending`; readiness
/// is only granted later through [`mark_node_ready`].
pub fn build_virtual_node(config: &BuildVirtualNodeConfig, node: &mut Node) {
    if node.metadata.name.is_none() {
        node.metadata.name = Some(virtual_node_name(&config.node_id));
    }

    let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_NODE_TYPE.to_string(), "virtual-kubelet".to_string());
    labels.insert(LABEL_NODE_ROLE.to_string(), "agent".to_string());
    labels.insert(LABEL_BASE_NAME.to_string(), config.biz_name.clone());
    labels.insert(LABEL_TECH_STACK.to_string(), config.tech_stack.clone());
    labels.insert(LABEL_BASE_VERSION.to_string(), config.version.clone());

    let spec = node.spec.get_or_insert_with(NodeSpec::default);
    spec.taints = Some(vec![Taint {
        key: VIRTUAL_NODE_TAINT_KEY.to_string(),
        value: Some(VIRTUAL_NODE_TAINT_VALUE.to_string()),
        effect: VIRTUAL_NODE_TAINT_EFFECT.to_string(),
        time_added: None,
    }]);

    let status = node.status.get_or_insert_with(NodeStatus::default);
    status.phase = Some(NODE_PHASE_PENDING.to_string());
    status.addresses = if config.node_ip.is_empty() {
        None
    } else {
        Some(vec![NodeAddress {
            type_: "InternalIP".to_string(),
            address: config.node_ip.clone(),
        }])
    };
    status.capacity = Some(placeholder_resources());
    status.allocatable = Some(placeholder_resources());
    status.node_info = Some(NodeSystemInfo {
        architecture: "amd64".to_string(),
        operating_system: "linux".to_string(),
        kubelet_version: config.version.clone(),
        ..Default::default()
    });
    status.conditions = Some(vec![NodeCondition {
        type_: CONDITION_READY.to_string(),
        status: "False".to_string(),
        reason: Some(REASON_BASE_NOT_READY.to_string()),
        message: Some("waiting for base heartbeat".to_string()),
        ..Default::default()
    }]);
}

fn placeholder_resources() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity("1000".to_string())),
        ("memory".to_string(), Quantity("1000Gi".to_string())),
        ("pods".to_string(), Quantity("65535".to_string())),
    ])
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == CONDITION_READY))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Mark the node Running with a True Ready condition. Returns whether readiness flipped.
pub fn mark_node_ready(node: &mut Node, now: DateTime<Utc>) -> bool {
    set_readiness(node, true, REASON_BASE_READY, "base is alive", now)
}

/// Mark the node Pending with a False Ready condition. Returns whether readiness flipped.
pub fn mark_node_not_ready(node: &mut Node, message: &str, now: DateTime<Utc>) -> bool {
    set_readiness(node, false, REASON_BASE_NOT_READY, message, now)
}

fn set_readiness(
    node: &mut Node,
    ready: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let was_ready = is_node_ready(node);
    let status = node.status.get_or_insert_with(NodeStatus::default);
    status.phase = Some(if ready { NODE_PHASE_RUNNING } else { NODE_PHASE_PENDING }.to_string());

    let conditions = status.conditions.get_or_insert_with(Vec::new);
    let idx = match conditions.iter().position(|c| c.type_ == CONDITION_READY) {
        Some(idx) => idx,
        None => {
            conditions.push(NodeCondition {
                type_: CONDITION_READY.to_string(),
                ..Default::default()
            });
            conditions.len() - 1
        }
    };

    let condition = &mut conditions[idx];
    let flipped = was_ready != ready;
    if flipped || condition.last_transition_time.is_none() {
        condition.last_transition_time = Some(Time(now));
    }
    condition.status = if ready { "True" } else { "False" }.to_string();
    condition.reason = Some(reason.to_string());
    condition.message = Some(message.to_string());
    condition.last_heartbeat_time = Some(Time(now));

    flipped
}
