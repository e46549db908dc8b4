//! Static table of the object kinds the orchestrator reads and writes.

use std::fmt;

use kube::discovery::ApiResource;

/// Object kinds addressed through the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cluster,
    KubeadmControlPlane,
    MachineDeployment,
    Machine,
    VSphereMachineTemplate,
    AwsMachineTemplate,
    AwsCluster,
    AzureMachineTemplate,
    Provider,
    ConfigMap,
    Secret,
    Deployment,
}

impl ResourceKind {
    /// `(group, version, kind, plural)` for this kind.
    const fn gvkp(self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Self::Cluster => ("cluster.x-k8s.io", "v1beta1", "Cluster", "clusters"),
            Self::KubeadmControlPlane => (
                "controlplane.cluster.x-k8s.io",
                "v1beta1",
                "KubeadmControlPlane",
                "kubeadmcontrolplanes",
            ),
            Self::MachineDeployment => (
                "cluster.x-k8s.io",
                "v1beta1",
                "MachineDeployment",
                "machinedeployments",
            ),
            Self::Machine => ("cluster.x-k8s.io", "v1beta1", "Machine", "machines"),
            Self::VSphereMachineTemplate => (
                "infrastructure.cluster.x-k8s.io",
                "v1beta1",
                "VSphereMachineTemplate",
                "vspheremachinetemplates",
            ),
            Self::AwsMachineTemplate => (
                "infrastructure.cluster.x-k8s.io",
                "v1beta2",
                "AWSMachineTemplate",
                "awsmachinetemplates",
            ),
            Self::AwsCluster => (
                "infrastructure.cluster.x-k8s.io",
                "v1beta2",
                "AWSCluster",
                "awsclusters",
            ),
            Self::AzureMachineTemplate => (
                "infrastructure.cluster.x-k8s.io",
                "v1beta1",
                "AzureMachineTemplate",
                "azuremachinetemplates",
            ),
            Self::Provider => (
                "clusterctl.cluster.x-k8s.io",
                "v1alpha3",
                "Provider",
                "providers",
            ),
            Self::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::Deployment => ("apps", "v1", "Deployment", "deployments"),
        }
    }

    /// The `kind` string as it appears in manifests and object references.
    pub const fn kind(self) -> &'static str {
        self.gvkp().2
    }

    /// The `apiVersion` string (`group/version`, or just `version` for core).
    pub fn api_version(self) -> String {
        let (group, version, _, _) = self.gvkp();
        if group.is_empty() {
            version.to_string()
        } else {
            format!("{group}/{version}")
        }
    }

    /// Build the `ApiResource` used to address this kind dynamically.
    pub fn api_resource(self) -> ApiResource {
        let (group, version, kind, plural) = self.gvkp();
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: self.api_version(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Resolve an infrastructure template kind from an object reference.
    pub fn infrastructure_template(kind: &str) -> Option<Self> {
        match kind {
            "VSphereMachineTemplate" => Some(Self::VSphereMachineTemplate),
            "AWSMachineTemplate" => Some(Self::AwsMachineTemplate),
            "AzureMachineTemplate" => Some(Self::AzureMachineTemplate),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Build an `ApiResource` for an arbitrary `apiVersion`/`kind` pair found in a manifest.
pub fn api_resource_for(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize(kind),
    }
}

/// Lower-case plural of a kind, following the Kubernetes naming rules.
fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with('x') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'i', 'o', 'u'])
    {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}
