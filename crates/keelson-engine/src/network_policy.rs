// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network policy synthesis.
//!
//! Maps an app's `{ingress, egress}` policy modes to a `NetworkPolicy`
//! selecting the app's pods.
//!
//! | Mode | Ingress from | Egress to (after DNS) |
//! |------|--------------|------------------------|
//! | `ALLOW_ALL` | router, namespace | public internet, namespace |
//! | `INTERNET_ONLY` | router, backup jobs | public internet |
//! | `NAMESPACE_ONLY` | namespace | namespace |
//! | `DENY_ALL` | backup jobs | nothing, not even DNS |
//!
//! Policy types are always `[Ingress, Egress]`, so an empty rule list denies
//! that direction entirely.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::info;

use crate::cluster::{APP_LABEL, ApplyOutcome, BACKUP_JOB_TYPE, Cluster, JOB_TYPE_LABEL, app_labels};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{App, PolicyMode};

/// Address ranges never reachable through the internet egress rule.
pub const PRIVATE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";
const ROUTER_POD_LABEL: &str = "app.kubernetes.io/name";
const DNS_NAMESPACE: &str = "kube-system";
const DNS_POD_LABEL: (&str, &str) = ("k8s-app", "kube-dns");

/// Name of an app's network policy.
pub fn policy_name(app_id: &str) -> String {
    format!("{app_id}-netpol")
}

fn selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

fn same_namespace_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(LabelSelector::default()),
        ..Default::default()
    }
}

fn router_peer(config: &EngineConfig) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(selector(&[(NAMESPACE_NAME_LABEL, &config.router_namespace)])),
        pod_selector: Some(selector(&[(ROUTER_POD_LABEL, &config.router_pod_label)])),
        ..Default::default()
    }
}

fn backup_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(selector(&[(JOB_TYPE_LABEL, BACKUP_JOB_TYPE)])),
        ..Default::default()
    }
}

fn internet_peer() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: "0.0.0.0/0".to_string(),
            except: Some(PRIVATE_RANGES.iter().map(|r| r.to_string()).collect()),
        }),
        ..Default::default()
    }
}

fn dns_rule() -> NetworkPolicyEgressRule {
    let port = |protocol: &str| NetworkPolicyPort {
        port: Some(IntOrString::Int(53)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };
    NetworkPolicyEgressRule {
        to: Some(vec![NetworkPolicyPeer {
            namespace_selector: Some(selector(&[(NAMESPACE_NAME_LABEL, DNS_NAMESPACE)])),
            pod_selector: Some(selector(&[DNS_POD_LABEL])),
            ..Default::default()
        }]),
        ports: Some(vec![port("UDP"), port("TCP")]),
    }
}

/// Inbound rules for a policy mode.
pub fn ingress_rules(mode: PolicyMode, config: &EngineConfig) -> Vec<NetworkPolicyIngressRule> {
    let peers = match mode {
        PolicyMode::AllowAll => vec![router_peer(config), same_namespace_peer()],
        PolicyMode::InternetOnly => vec![router_peer(config), backup_peer()],
        PolicyMode::NamespaceOnly => vec![same_namespace_peer()],
        // Scheduled backups keep working under full isolation
        PolicyMode::DenyAll => vec![backup_peer()],
    };
    peers
        .into_iter()
        .map(|peer| NetworkPolicyIngressRule {
            from: Some(vec![peer]),
            ports: None,
        })
        .collect()
}

/// Outbound rules for a policy mode. DNS comes first unless everything is denied.
pub fn egress_rules(mode: PolicyMode) -> Vec<NetworkPolicyEgressRule> {
    let peers = match mode {
        PolicyMode::DenyAll => return vec![],
        PolicyMode::AllowAll => vec![internet_peer(), same_namespace_peer()],
        PolicyMode::InternetOnly => vec![internet_peer()],
        PolicyMode::NamespaceOnly => vec![same_namespace_peer()],
    };
    std::iter::once(dns_rule())
        .chain(peers.into_iter().map(|peer| NetworkPolicyEgressRule {
            to: Some(vec![peer]),
            ports: None,
        }))
        .collect()
}

// The API server omits empty rule lists; the declared `policyTypes` still deny
fn non_empty<T>(rules: Vec<T>) -> Option<Vec<T>> {
    (!rules.is_empty()).then_some(rules)
}

/// Network policy for an app.
pub fn build_policy(app: &App, config: &EngineConfig) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(policy_name(&app.id)),
            namespace: Some(app.namespace().to_string()),
            labels: Some(app_labels(&app.id)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: selector(&[(APP_LABEL, &app.id)]),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: non_empty(ingress_rules(app.network.ingress, config)),
            egress: non_empty(egress_rules(app.network.egress)),
        }),
        ..Default::default()
    }
}

/// Apply the app's network policy, or delete it when isolation is disabled.
pub async fn reconcile_network_policy(
    cluster: &Cluster,
    app: &App,
    config: &EngineConfig,
) -> Result<Option<ApplyOutcome>> {
    let namespace = app.namespace();
    if !app.network.use_network_policy {
        if cluster
            .delete::<NetworkPolicy>(namespace, &policy_name(&app.id))
            .await?
        {
            info!(app_id = %app.id, namespace, "Removed network policy");
        }
        return Ok(None);
    }

    let outcome = cluster.apply(namespace, &build_policy(app, config)).await?;
    if outcome != ApplyOutcome::Unchanged {
        info!(
            app_id = %app.id,
            namespace,
            ingress = app.network.ingress.as_str(),
            egress = app.network.egress.as_str(),
            "Applied network policy"
        );
    }
    Ok(Some(outcome))
}
