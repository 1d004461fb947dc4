// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service port aggregation.
//!
//! Domain ports and explicit app ports are merged into one Service port set.
//! Entries are unique by `(port, target_port)`; the first name seen wins.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{Service, ServicePort as K8sServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::info;

use crate::cluster::{APP_LABEL, ApplyOutcome, Cluster, app_labels};
use crate::error::Result;
use crate::model::{App, AppDomain, AppPort};

/// One entry of an app's Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Port name, unique within the Service.
    pub name: String,
    /// Service port.
    pub port: i32,
    /// Container port.
    pub target_port: i32,
}

/// Name of an app's Service.
pub fn service_name(app_id: &str) -> String {
    format!("svc-{app_id}")
}

/// Merge domain and explicit ports, deduplicated and sorted by port.
pub fn aggregate_ports(domains: &[AppDomain], ports: &[AppPort]) -> Vec<ServicePort> {
    let candidates = domains
        .iter()
        .map(|d| (format!("http-{}", d.port), d.port))
        .chain(ports.iter().map(|p| (format!("port-{}", p.port), p.port)));

    let mut seen = HashSet::new();
    let mut merged: Vec<ServicePort> = candidates
        .filter(|(_, port)| seen.insert((*port, *port)))
        .map(|(name, port)| ServicePort {
            name,
            port,
            target_port: port,
        })
        .collect();
    merged.sort_by_key(|p| p.port);
    merged
}

/// Service object for the given port set.
pub fn build_service(app: &App, ports: &[ServicePort]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&app.id)),
            namespace: Some(app.namespace().to_string()),
            labels: Some(app_labels(&app.id)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(APP_LABEL.to_string(), app.id.clone())])),
            ports: Some(
                ports
                    .iter()
                    .map(|p| K8sServicePort {
                        name: Some(p.name.clone()),
                        port: p.port,
                        target_port: Some(IntOrString::Int(p.target_port)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create, update or remove the app's Service.
///
/// Returns `None` when the app exposes no port and the Service was removed.
pub async fn reconcile_service(cluster: &Cluster, app: &App) -> Result<Option<ApplyOutcome>> {
    let ports = aggregate_ports(&app.domains, &app.ports);
    let namespace = app.namespace();

    if ports.is_empty() {
        if cluster
            .delete::<Service>(namespace, &service_name(&app.id))
            .await?
        {
            info!(app_id = %app.id, namespace, "Removed service without ports");
        }
        return Ok(None);
    }

    let outcome = cluster.apply(namespace, &build_service(app, &ports)).await?;
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::model::fixtures::app;
    use std::sync::Arc;

    fn domain(hostname: &str, port: i32) -> AppDomain {
        AppDomain {
            id: hostname.to_string(),
            hostname: hostname.to_string(),
            port,
            use_ssl: true,
            redirect_https: true,
        }
    }

    #[test]
    fn test_duplicates_collapse_first_name_wins() {
        let domains = vec![domain("a.example.com", 8080), domain("b.example.com", 8080)];
        let ports = vec![
            AppPort { id: "p1".into(), port: 9000 },
            AppPort { id: "p2".into(), port: 8080 },
        ];

        let merged = aggregate_ports(&domains, &ports);
        assert_eq!(
            merged,
            vec![
                ServicePort { name: "http-8080".into(), port: 8080, target_port: 8080 },
                ServicePort { name: "port-9000".into(), port: 9000, target_port: 9000 },
            ]
        );
    }

    #[test]
    fn test_no_inputs_no_ports() {
        assert!(aggregate_ports(&[], &[]).is_empty());
    }

    #[tokio::test]
    async fn test_empty_port_set_removes_service() {
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let mut app = app("a1");
        app.ports = vec![AppPort { id: "p1".into(), port: 80 }];

        assert_eq!(
            reconcile_service(&cluster, &app).await.unwrap(),
            Some(ApplyOutcome::Created)
        );
        assert_eq!(
            reconcile_service(&cluster, &app).await.unwrap(),
            Some(ApplyOutcome::Unchanged)
        );

        app.ports.clear();
        assert_eq!(reconcile_service(&cluster, &app).await.unwrap(), None);
        assert!(mock.names("Service", "proj-1").await.is_empty());
    }
}
