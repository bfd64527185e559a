//! Policy and snapshot sources backed by the twin client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use twin_policy::{PolicyError, PolicyResult, PolicySource, SignedPolicy};
use twin_shadow::{ShadowError, ShadowResult, SnapshotSource};

use crate::client::TwinClient;

/// Fetches the signed policy envelope from its submodel element.
pub struct SubmodelPolicySource {
    client: Arc<TwinClient>,
    submodel: String,
    path: String,
}

impl SubmodelPolicySource {
    /// Creates a source reading `submodel/path` through the client.
    #[must_use]
    pub fn new(client: Arc<TwinClient>, submodel: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client,
            submodel: submodel.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl PolicySource for SubmodelPolicySource {
    async fn fetch(&self) -> PolicyResult<SignedPolicy> {
        let value = self
            .client
            .read_path(&self.submodel, &self.path)
            .await
            .map_err(|err| PolicyError::Source {
                reason: err.to_string(),
            })?;

        debug!(submodel = %self.submodel, path = %self.path, "policy element fetched");
        serde_json::from_value(value).map_err(|err| PolicyError::Unverified {
            reason: format!("policy element is not a signed envelope: {err}"),
        })
    }
}

/// Produces full shadow snapshots by reading each configured submodel in
/// value-only form.
pub struct TwinSnapshotSource {
    client: Arc<TwinClient>,
    submodels: Vec<String>,
}

impl TwinSnapshotSource {
    /// Creates a source covering the supplied submodel identifiers.
    #[must_use]
    pub fn new(client: Arc<TwinClient>, submodels: Vec<String>) -> Self {
        Self { client, submodels }
    }
}

#[async_trait]
impl SnapshotSource for TwinSnapshotSource {
    async fn snapshot(&self) -> ShadowResult<HashMap<String, HashMap<String, Value>>> {
        let mut full = HashMap::new();
        for submodel in &self.submodels {
            let values = self
                .client
                .read_submodel_values(submodel)
                .await
                .map_err(|err| ShadowError::Snapshot {
                    reason: format!("submodel `{submodel}`: {err}"),
                })?;
            full.insert(submodel.clone(), values);
        }
        Ok(full)
    }
}
