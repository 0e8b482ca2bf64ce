// Static ACL Adapter
//
// Parses an access-control document and exposes it through the
// `AccessControl` seam. Used by the CLI and by tests; production
// deployments look records up in the project store instead.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::{AccessControl, AccessRecord, AuthError};
use crate::log::BuildId;

/// On-disk ACL document.
///
/// ```json
/// { "builds": [ { "build_id": "…", "project_id": "…", "owner": "…", "members": [] } ] }
/// ```
#[derive(Debug, Deserialize)]
pub struct AclDocument {
    pub builds: Vec<AccessRecord>,
}

/// Read-only ACL held in memory.
#[derive(Debug, Default, Clone)]
pub struct StaticAcl {
    records: HashMap<BuildId, AccessRecord>,
}

impl StaticAcl {
    pub fn from_records(records: impl IntoIterator<Item = AccessRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.build_id, r)).collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let document: AclDocument = serde_json::from_str(json)?;
        Ok(Self::from_records(document.builds))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AccessControl for StaticAcl {
    async fn lookup(&self, build_id: &BuildId) -> Result<Option<AccessRecord>, AuthError> {
        Ok(self.records.get(build_id).cloned())
    }
}
