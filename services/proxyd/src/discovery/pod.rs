//! Pod view consumed by the discovery watcher.

use std::collections::BTreeMap;

/// Label values that mark a pod as an API server.
const API_SERVER_LABELS: &[(&str, &str)] = &[
    // Static-pod control planes.
    ("component", "kube-apiserver"),
    // Self-hosted control planes.
    ("k8s-app", "self-hosted-kube-apiserver"),
];

/// Readiness of one container in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReadiness {
    pub name: String,
    pub ready: bool,
}

/// The subset of a pod the proxy cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Pod IP; `None` or empty until the pod is scheduled and networked.
    pub ip: Option<String>,
    pub containers: Vec<ContainerReadiness>,
}

impl Pod {
    /// Pod IP, treating an empty string as absent.
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref().filter(|ip| !ip.is_empty())
    }

    /// True when no container reports not-ready.
    pub fn all_ready(&self) -> bool {
        self.containers.iter().all(|c| c.ready)
    }

    pub fn is_api_server(&self) -> bool {
        API_SERVER_LABELS
            .iter()
            .any(|(key, value)| self.labels.get(*key).map(String::as_str) == Some(*value))
    }
}

/// A pod lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Added(Pod),
    Updated { old: Pod, new: Pod },
    Deleted(Pod),
}

impl PodEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PodEvent::Added(_) => "added",
            PodEvent::Updated { .. } => "updated",
            PodEvent::Deleted(_) => "deleted",
        }
    }

    /// The most recent state of the pod carried by this event.
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Deleted(pod) => pod,
            PodEvent::Updated { new, .. } => new,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pod_with_labels(labels: &[(&str, &str)]) -> Pod {
        Pod {
            uid: "uid-1".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(&[("component", "kube-apiserver")], true)]
    #[case(&[("k8s-app", "self-hosted-kube-apiserver")], true)]
    #[case(&[("component", "kube-scheduler")], false)]
    #[case(&[("k8s-app", "kube-apiserver")], false)]
    #[case(&[], false)]
    fn test_is_api_server(#[case] labels: &[(&str, &str)], #[case] expected: bool) {
        assert_eq!(pod_with_labels(labels).is_api_server(), expected);
    }

    #[test]
    fn test_empty_ip_is_absent() {
        let mut pod = Pod::default();
        assert_eq!(pod.ip(), None);
        pod.ip = Some(String::new());
        assert_eq!(pod.ip(), None);
        pod.ip = Some("10.0.0.5".to_string());
        assert_eq!(pod.ip(), Some("10.0.0.5"));
    }

    #[test]
    fn test_all_ready() {
        let mut pod = Pod::default();
        assert!(pod.all_ready());

        pod.containers = vec![
            ContainerReadiness {
                name: "kube-apiserver".to_string(),
                ready: true,
            },
            ContainerReadiness {
                name: "sidecar".to_string(),
                ready: false,
            },
        ];
        assert!(!pod.all_ready());
    }
}
