use thiserror::Error;
use tokio::time::Duration;

/// Errors surfaced by the hierarchy controllers and the syncer.
///
/// Transient errors (API I/O, conflicts, caches still filling) are retried
/// with backoff by the owning queue or controller. Permanent-for-key errors
/// (cycles, UID mismatches, bad mode transitions) are surfaced as conditions
/// or events and never retried automatically.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("setting parent of '{child}' to '{parent}' would create a cycle")]
    CycleDetected { child: String, parent: String },

    #[error("object '{namespace}/{name}' exists with UID '{found}', expected '{expected}'")]
    DelegatedUidMismatch {
        namespace: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("service account token secret for '{0}' is not ready")]
    ServiceAccountNotReady(String),

    #[error("virtual node '{0}' is being deleted")]
    VirtualNodeDeleting(String),

    #[error("cluster '{0}' is not registered")]
    UnknownCluster(String),

    #[error("cluster name '{name}' is invalid: {reason}")]
    InvalidClusterName { name: String, reason: String },

    #[error("resource '{group}/{resource}' was not found in the cluster")]
    TypeNotFound { group: String, resource: String },

    #[error("changing '{resource}' from Ignore to Propagate requires force")]
    ForceRequired { resource: String },

    #[error("resource '{resource}' is always propagated; its mode cannot change")]
    EnforcedModeForbidden { resource: String },

    #[error("namespace '{namespace}' has descendants and cascading deletion is off")]
    CascadeForbidden { namespace: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Whether the owning queue should retry this key with backoff.
    ///
    /// Permanent-for-key failures are reported once and wait for the object
    /// to change; retrying them would spin without making progress.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                // Conflict and server-side throttling resolve on their own;
                // 4xx validation failures do not.
                ae.code == 409 || ae.code == 429 || ae.code >= 500
            }
            Error::Kube(_) => true,
            Error::ServiceAccountNotReady(_) | Error::VirtualNodeDeleting(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Backoff schedule for keyed retries: 100ms * 2^attempt, capped at 30s.
pub fn backoff_for(attempt: u32) -> Duration {
    let base = Duration::from_millis(100);
    let capped = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    capped.min(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::ServiceAccountNotReady("default".into()).is_transient());
        assert!(Error::VirtualNodeDeleting("n1".into()).is_transient());
        assert!(
            !Error::CycleDetected {
                child: "a".into(),
                parent: "b".into()
            }
            .is_transient()
        );
        assert!(
            !Error::DelegatedUidMismatch {
                namespace: "ns".into(),
                name: "pod".into(),
                expected: "u1".into(),
                found: "u2".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        assert_eq!(backoff_for(0), Duration::from_millis(100));
        assert_eq!(backoff_for(1), Duration::from_millis(200));
        assert_eq!(backoff_for(20), Duration::from_secs(30));
    }
}
