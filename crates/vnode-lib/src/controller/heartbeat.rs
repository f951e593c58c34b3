//! Liveness probing and node readiness

use super::Inner;
use crate::error::Error;
use crate::health::components;
use crate::models::HealthProbe;
use crate::transport::QoS;
use crate::translate::{mark_node_not_ready, mark_node_ready};
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Probe the base on every tick and keep the node's Ready condition current.
///
/// Gives up with `HeartbeatLost` after `max_heartbeat_failures` consecutive
/// failed probes.
pub(crate) async fn run(inner: Arc<Inner>, mut node: Node, stop: CancellationToken) {
    let mut ticker = interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            flow = beat(&inner, &mut node, &mut failures, &stop) => {
                if flow.is_break() {
                    break;
                }
            }
        }
    }
}

/// One probe plus the node status refresh that follows it
async fn beat(
    inner: &Inner,
    node: &mut Node,
    failures: &mut u32,
    stop: &CancellationToken,
) -> ControlFlow<()> {
    let config = &inner.config;
    let probe = HealthProbe {
        node_id: config.node.node_id.clone(),
        timestamp: Utc::now().timestamp_millis(),
    };
    let payload = match serde_json::to_vec(&probe) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode health probe");
            return ControlFlow::Continue(());
        }
    };

    let result = inner
        .transport
        .publish_with_timeout(
            &inner.topics.health(),
            QoS::AtLeastOnce,
            false,
            payload,
            config.operation_timeout,
        )
        .await;
    inner.health.record(components::TRANSPORT, &result).await;

    let probe_ok = match result {
        Ok(()) => {
            *failures = 0;
            inner.health.set_healthy(components::HEARTBEAT).await;
            true
        }
        Err(e) => {
            *failures += 1;
            inner.metrics.inc_heartbeat_failures();
            inner.metrics.inc_transport_failure("heartbeat");
            warn!(
                failures = *failures,
                max = config.max_heartbeat_failures,
                error = %e,
                "Health probe failed"
            );
            if *failures >= config.max_heartbeat_failures {
                inner
                    .health
                    .set_unhealthy(components::HEARTBEAT, e.to_string())
                    .await;
                inner.fail(Error::HeartbeatLost(*failures), stop);
                return ControlFlow::Break(());
            }
            inner
                .health
                .set_degraded(components::HEARTBEAT, e.to_string())
                .await;
            false
        }
    };

    let base_alive = inner
        .inbound
        .liveness
        .is_fresh(config.base_heartbeat_timeout);
    let now = Utc::now();
    let (ready, reason) = match (probe_ok, base_alive) {
        (true, true) => (true, "base is alive"),
        (true, false) => (false, "no heartbeat from base"),
        (false, _) => (false, "health probe failed"),
    };
    let flipped = if ready {
        mark_node_ready(node, now)
    } else {
        mark_node_not_ready(node, reason, now)
    };
    if flipped {
        inner.logger.log_node_readiness(ready, reason);
        inner.metrics.set_node_ready(ready);
    }

    match inner
        .bounded("update node status", inner.cluster.update_node_status(node))
        .await
    {
        Ok(()) => {
            debug!(node = %inner.node_name, "Node status refreshed");
            inner.health.set_healthy(components::CLUSTER).await;
        }
        Err(e) => {
            warn!(node = %inner.node_name, error = %e, "Failed to update node status");
            inner
                .health
                .set_degraded(components::CLUSTER, e.to_string())
                .await;
        }
    }
    ControlFlow::Continue(())
}
