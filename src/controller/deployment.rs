//! Pool Deployment
//!
//! Every CStorPool is served by a single-replica Deployment of the same
//! name, pinned to the pool's node and owned by the pool.

use crate::config::OperatorConfig;
use crate::crd::{controller_owner, CStorPool, CStorPoolCluster, CSPC_LABEL, CSP_LABEL, HOSTNAME_LABEL};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::info;

pub const POOL_CONTAINER: &str = "cstor-pool";
pub const POOL_MGMT_CONTAINER: &str = "cstor-pool-mgmt";

/// Env var carrying the uid of the served pool
pub const POOL_ID_ENV: &str = "OPENEBS_IO_CSPI_ID";

pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "cstor-pool";

/// Build the Deployment for `csp`. Pool level resources, tolerations and
/// priority class win over the cluster level defaults.
pub fn build_pool_deployment(
    csp: &CStorPool,
    cspc: &CStorPoolCluster,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<Deployment> {
    let uid = csp
        .uid()
        .ok_or_else(|| Error::Internal(format!("cstorpool {} has no uid", csp.name())))?;
    let owner = controller_owner(csp)
        .ok_or_else(|| Error::Internal(format!("cstorpool {} has no owner reference", csp.name())))?;

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (CSP_LABEL.to_string(), csp.name().to_string()),
        (CSPC_LABEL.to_string(), cspc.name().to_string()),
    ]);

    let pool_config = &csp.spec.pool_config;
    let resources = pool_config.resources.clone().or_else(|| cspc.spec.resources.clone());
    let aux_resources = pool_config
        .aux_resources
        .clone()
        .or_else(|| cspc.spec.aux_resources.clone());
    let tolerations = if pool_config.tolerations.is_empty() {
        cspc.spec.tolerations.clone()
    } else {
        pool_config.tolerations.clone()
    };
    let priority_class_name = pool_config
        .priority_class_name
        .clone()
        .or_else(|| cspc.spec.priority_class_name.clone());

    let env = vec![
        EnvVar {
            name: POOL_ID_ENV.to_string(),
            value: Some(uid.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "NAMESPACE".to_string(),
            value: Some(namespace.to_string()),
            ..Default::default()
        },
    ];
    let mounts = vec![
        VolumeMount {
            name: "device".to_string(),
            mount_path: "/dev".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "udev".to_string(),
            mount_path: "/run/udev".to_string(),
            ..Default::default()
        },
    ];
    let privileged = Some(SecurityContext {
        privileged: Some(true),
        ..Default::default()
    });

    let containers = vec![
        Container {
            name: POOL_CONTAINER.to_string(),
            image: Some(config.pool_image.clone()),
            env: Some(env.clone()),
            resources,
            security_context: privileged.clone(),
            volume_mounts: Some(mounts.clone()),
            ..Default::default()
        },
        Container {
            name: POOL_MGMT_CONTAINER.to_string(),
            image: Some(config.pool_mgmt_image.clone()),
            env: Some(env),
            resources: aux_resources,
            security_context: privileged,
            volume_mounts: Some(mounts),
            ..Default::default()
        },
    ];

    let volumes = vec![host_path_volume("device", "/dev"), host_path_volume("udev", "/run/udev")];

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(csp.name().to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: Some(BTreeMap::from([(
                        HOSTNAME_LABEL.to_string(),
                        csp.spec.host_name.clone(),
                    )])),
                    containers,
                    volumes: Some(volumes),
                    tolerations: (!tolerations.is_empty()).then_some(tolerations),
                    priority_class_name,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

/// Create the Deployment for `csp` unless it exists; returns whether a
/// Deployment was created
pub async fn ensure_pool_deployment(
    api: &dyn ClusterApi,
    csp: &CStorPool,
    cspc: &CStorPoolCluster,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<bool> {
    if api.get_deployment(namespace, csp.name()).await?.is_some() {
        return Ok(false);
    }
    let deployment = build_pool_deployment(csp, cspc, namespace, config)?;
    match api.create_deployment(namespace, &deployment).await {
        Ok(_) => {
            info!(pool = %csp.name(), host = %csp.spec.host_name, "created pool deployment");
            Ok(true)
        }
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CStorPoolClusterSpec, CStorPoolSpec, PoolConfig};
    use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn pool(pool_config: PoolConfig) -> CStorPool {
        let mut csp = CStorPool::new(
            "cspc-a-abc123",
            CStorPoolSpec {
                host_name: "node-1".into(),
                pool_config,
                raid_groups: vec![],
            },
        );
        csp.metadata.uid = Some("csp-uid".into());
        csp
    }

    fn cluster() -> CStorPoolCluster {
        CStorPoolCluster::new(
            "cspc-a",
            CStorPoolClusterSpec {
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([("memory".to_string(), Quantity("2Gi".into()))])),
                    ..Default::default()
                }),
                tolerations: vec![Toleration {
                    key: Some("storage".into()),
                    operator: Some("Exists".into()),
                    ..Default::default()
                }],
                priority_class_name: Some("cluster-default".into()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_deployment_shape() {
        let deployment =
            build_pool_deployment(&pool(PoolConfig::default()), &cluster(), "openebs", &OperatorConfig::default())
                .unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("cspc-a-abc123"));
        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "CStorPool");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));

        let pod = spec.template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap().get(HOSTNAME_LABEL).map(String::as_str),
            Some("node-1")
        );
        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![POOL_CONTAINER, POOL_MGMT_CONTAINER]);

        let env = pod.containers[0].env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == POOL_ID_ENV && e.value.as_deref() == Some("csp-uid")));

        // Cluster level defaults apply when the pool sets nothing
        assert!(pod.containers[0].resources.is_some());
        assert_eq!(pod.tolerations.unwrap().len(), 1);
        assert_eq!(pod.priority_class_name.as_deref(), Some("cluster-default"));
    }

    #[test]
    fn test_pool_settings_override_cluster_defaults() {
        let csp = pool(PoolConfig {
            priority_class_name: Some("pool-critical".into()),
            ..Default::default()
        });
        let deployment =
            build_pool_deployment(&csp, &cluster(), "openebs", &OperatorConfig::default()).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some("pool-critical"));
    }

    #[test]
    fn test_pool_without_uid_is_rejected() {
        let mut csp = pool(PoolConfig::default());
        csp.metadata.uid = None;
        assert!(build_pool_deployment(&csp, &cluster(), "openebs", &OperatorConfig::default()).is_err());
    }
}
