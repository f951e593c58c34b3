//! Translation between cluster objects and biz module descriptors
//!
//! Everything here is pure: no I/O, no shared state. The controller calls
//! these functions on every reconciliation pass.
//! - Virtual node construction and readiness marking
//! - Container/Pod to BizModel mapping and identity helpers
//! - ArkBizInfo to container status and pod status derivation

mod biz;
mod node;
mod status;

pub use biz::{
    cmp_biz_model, container_to_biz_model, identity_of, pod_key, pod_to_biz_models, BizIdentity,
};
pub use node::{
    build_virtual_node, is_node_ready, mark_node_not_ready, mark_node_ready, virtual_node_name,
    LABEL_BASE_NAME, LABEL_BASE_VERSION, LABEL_TECH_STACK, NODE_PHASE_PENDING, NODE_PHASE_RUNNING,
    VIRTUAL_NODE_TAINT_KEY,
};
pub use status::{
    biz_info_to_container_status, biz_info_to_container_status_at, build_pod_status, pod_phase,
    REASON_BIZ_DEACTIVATED, REASON_BIZ_PENDING, REASON_BIZ_RESOLVED,
};
