/// Normalized kind tag used for every kind-specific rule (readiness, pod
/// selectors, deployment pairing). Every API generation of a kind maps to the
/// same family; anything not in the table is `Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFamily {
    Pod,
    Service,
    PersistentVolumeClaim,
    ReplicationController,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Job,
    Unsupported,
}

const KIND_TABLE: &[(&str, &str, KindFamily)] = &[
    ("", "Pod", KindFamily::Pod),
    ("", "Service", KindFamily::Service),
    ("", "PersistentVolumeClaim", KindFamily::PersistentVolumeClaim),
    ("", "ReplicationController", KindFamily::ReplicationController),
    ("apps", "Deployment", KindFamily::Deployment),
    ("extensions", "Deployment", KindFamily::Deployment),
    ("apps", "DaemonSet", KindFamily::DaemonSet),
    ("extensions", "DaemonSet", KindFamily::DaemonSet),
    ("apps", "StatefulSet", KindFamily::StatefulSet),
    ("apps", "ReplicaSet", KindFamily::ReplicaSet),
    ("extensions", "ReplicaSet", KindFamily::ReplicaSet),
    ("batch", "Job", KindFamily::Job),
];

impl KindFamily {
    pub fn of(group: &str, kind: &str) -> Self {
        KIND_TABLE
            .iter()
            .find(|(g, k, _)| *g == group && *k == kind)
            .map(|(_, _, f)| *f)
            .unwrap_or(KindFamily::Unsupported)
    }

    /// Controllers whose readiness is judged through the pods they select.
    pub fn selects_pods(self) -> bool {
        matches!(
            self,
            KindFamily::ReplicationController | KindFamily::DaemonSet | KindFamily::StatefulSet | KindFamily::ReplicaSet
        )
    }
}
