// Authorization Gate
//
// Decides whether a verified caller may observe a build's events.
// Runs exactly once per connection attempt, before any log or bridge
// access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::log::BuildId;

/// Log target for security-relevant rejections.
pub const SECURITY_TARGET: &str = "buildstream::security";

/// Identity of the caller, as established by the session layer.
///
/// Only construct this from a verified session or token subject, never
/// from client-supplied request fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    subject: String,
}

impl CallerIdentity {
    pub fn verified(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Access-control record for one build, owned by its project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub build_id: BuildId,
    pub project_id: String,
    pub owner: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl AccessRecord {
    pub fn admits(&self, caller: &CallerIdentity) -> bool {
        self.owner == caller.subject() || self.members.iter().any(|m| m == caller.subject())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("access control lookup failed: {0}")]
    Unavailable(String),
}

/// External lookup of project/build access-control records.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Returns `None` when no record exists for the build.
    async fn lookup(&self, build_id: &BuildId) -> Result<Option<AccessRecord>, AuthError>;
}

/// Why a caller was turned away. Never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownBuild,
    NotAMember,
    LookupFailed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::UnknownBuild => "unknown_build",
            DenyReason::NotAMember => "not_a_member",
            DenyReason::LookupFailed => "lookup_failed",
        }
    }
}

/// Proof that a caller passed the gate for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub build_id: BuildId,
    pub project_id: String,
    pub caller: CallerIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Authorized(Grant),
    Denied(DenyReason),
}

pub struct AuthorizationGate<A: AccessControl> {
    acl: A,
}

impl<A: AccessControl> AuthorizationGate<A> {
    pub fn new(acl: A) -> Self {
        Self { acl }
    }

    /// Ownership/membership check against the build's access record.
    ///
    /// Fails closed: a lookup error denies.
    pub async fn authorize(&self, caller: &CallerIdentity, build_id: BuildId) -> Decision {
        let reason = match self.acl.lookup(&build_id).await {
            Ok(Some(record)) if record.admits(caller) => {
                debug!(%build_id, caller = caller.subject(), project = %record.project_id, "stream access granted");
                return Decision::Authorized(Grant {
                    build_id,
                    project_id: record.project_id,
                    caller: caller.clone(),
                });
            }
            Ok(Some(_)) => DenyReason::NotAMember,
            Ok(None) => DenyReason::UnknownBuild,
            Err(e) => {
                warn!(target: SECURITY_TARGET, %build_id, error = %e, "access control lookup failed");
                DenyReason::LookupFailed
            }
        };

        warn!(
            target: SECURITY_TARGET,
            %build_id,
            caller = caller.subject(),
            reason = reason.as_str(),
            "stream access denied"
        );
        Decision::Denied(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::acl::StaticAcl;

    struct BrokenAcl;

    #[async_trait]
    impl AccessControl for BrokenAcl {
        async fn lookup(&self, _build_id: &BuildId) -> Result<Option<AccessRecord>, AuthError> {
            Err(AuthError::Unavailable("connection refused".into()))
        }
    }

    fn record(build_id: BuildId) -> AccessRecord {
        AccessRecord {
            build_id,
            project_id: "project789".into(),
            owner: "user123".into(),
            members: vec!["teammate".into()],
        }
    }

    #[tokio::test]
    async fn owner_and_members_are_authorized() {
        let build = BuildId::new();
        let gate = AuthorizationGate::new(StaticAcl::from_records([record(build)]));

        for subject in ["user123", "teammate"] {
            let caller = CallerIdentity::verified(subject);
            match gate.authorize(&caller, build).await {
                Decision::Authorized(grant) => {
                    assert_eq!(grant.build_id, build);
                    assert_eq!(grant.project_id, "project789");
                    assert_eq!(grant.caller, caller);
                }
                Decision::Denied(reason) => panic!("unexpected denial: {reason:?}"),
            }
        }
    }

    #[tokio::test]
    async fn strangers_and_unknown_builds_are_denied() {
        let build = BuildId::new();
        let gate = AuthorizationGate::new(StaticAcl::from_records([record(build)]));
        let stranger = CallerIdentity::verified("mallory");

        assert_eq!(
            gate.authorize(&stranger, build).await,
            Decision::Denied(DenyReason::NotAMember)
        );
        assert_eq!(
            gate.authorize(&CallerIdentity::verified("user123"), BuildId::new())
                .await,
            Decision::Denied(DenyReason::UnknownBuild)
        );
    }

    #[tokio::test]
    async fn lookup_failure_fails_closed() {
        let gate = AuthorizationGate::new(BrokenAcl);
        let decision = gate
            .authorize(&CallerIdentity::verified("user123"), BuildId::new())
            .await;
        assert_eq!(decision, Decision::Denied(DenyReason::LookupFailed));
    }
}
