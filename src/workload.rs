use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{self, Debug};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
        }
    }
}

/// Identifies one watched workload in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn of<W: Workload>(workload: &W) -> Self {
        Self {
            kind: W::KIND,
            namespace: workload.namespace().unwrap_or_default(),
            name: workload.name_any(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A namespaced resource whose pod template can be rolled onto a new image.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    fn containers(&self) -> &[Container] {
        self.pod_spec()
            .map(|ps| ps.containers.as_slice())
            .unwrap_or_default()
    }

    /// Points the named container at `image`. Returns false when the pod
    /// template has no such container.
    fn set_container_image(&mut self, container_name: &str, image: &str) -> bool {
        let Some(pod_spec) = self.pod_spec_mut() else {
            return false;
        };
        match pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == container_name)
        {
            Some(container) => {
                container.image = Some(image.to_string());
                true
            }
            None => false,
        }
    }
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn template(containers: &[(&str, &str)]) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(name, image)| Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn metadata(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn deployment(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: metadata(namespace, name),
            spec: Some(DeploymentSpec {
                template: template(containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn stateful_set(namespace: &str, name: &str, containers: &[(&str, &str)]) -> StatefulSet {
        StatefulSet {
            metadata: metadata(namespace, name),
            spec: Some(StatefulSetSpec {
                template: template(containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
