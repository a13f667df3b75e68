use crate::ObjectKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a reconciliation call can surface. Object-scoped variants
/// carry the offending object's identity so callers can render it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed decoding manifest into objects: {0}")]
    Decode(String),
    #[error("serializing {key}: {source}")]
    Encoding {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("no objects visited")]
    NoObjects,
    #[error("expected exactly one Pod in the manifest, found {0} objects")]
    NotSinglePod(usize),
    #[error("unable to recognize {key}: no matches for kind {kind:?} in version {api_version:?}")]
    UnknownKind { key: ObjectKey, kind: String, api_version: String },
    #[error("no {} with the name {:?} found", .0.kind, .0.name)]
    Orphan(ObjectKey),
    #[error("cannot patch {key}: {source}")]
    Patch {
        key: ObjectKey,
        #[source]
        source: Box<Error>,
    },
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("timed out waiting for the condition; not ready: {}", join_keys(.pending))]
    ReadinessTimeout { pending: Vec<ObjectKey> },
    #[error("watch of {key} failed: {message}")]
    Watch { key: ObjectKey, message: String },
    #[error("job failed: {key}: {reason}")]
    JobFailed { key: ObjectKey, reason: String },
    #[error("{0} is not a Pod")]
    NotAPod(ObjectKey),
    #[error("unsupported kind when getting selector: {0}")]
    UnsupportedKind(ObjectKey),
    #[error("{key}: {source}")]
    Api {
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Map a transport error for `key`, folding HTTP 404 into `NotFound`.
    pub fn api(key: ObjectKey, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(key),
            _ => Error::Api { key, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Identity of the object this error is about, when there is one.
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            Error::Encoding { key, .. }
            | Error::Patch { key, .. }
            | Error::Watch { key, .. }
            | Error::JobFailed { key, .. }
            | Error::Api { key, .. } => Some(key),
            Error::UnknownKind { key, .. } => Some(key),
            Error::Orphan(key) | Error::NotFound(key) | Error::NotAPod(key) | Error::UnsupportedKind(key) => Some(key),
            Error::Decode(_) | Error::NoObjects | Error::NotSinglePod(_) | Error::ReadinessTimeout { .. } | Error::Aggregate(_) => None,
        }
    }
}

fn join_keys(keys: &[ObjectKey]) -> String {
    keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
}

fn join_errors(errs: &[Error]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn key() -> ObjectKey {
        ObjectKey::new("Deployment", Some("ns"), "web")
    }

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: "Test".into(), code })
    }

    #[test]
    fn not_found_is_folded() {
        assert!(Error::api(key(), api_err(404)).is_not_found());
        assert!(!Error::api(key(), api_err(409)).is_not_found());
    }

    #[test]
    fn aggregate_joins_messages() {
        let e = Error::Aggregate(vec![Error::NotAPod(key()), Error::Orphan(key())]);
        assert_eq!(e.to_string(), "Deployment \"ns/web\" is not a Pod && no Deployment with the name \"web\" found");
    }

    #[test]
    fn errors_name_their_object() {
        let e = Error::Patch { key: key(), source: Box::new(Error::api(key(), api_err(422))) };
        assert_eq!(e.key(), Some(&key()));
        assert!(e.to_string().starts_with("cannot patch Deployment \"ns/web\""));
    }
}
