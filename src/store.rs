//! Declared-state store for `EKSUpgrade` resources.
//!
//! Status writes are guarded by the object's `resourceVersion`: a write based
//! on a stale read fails with a conflict instead of overwriting.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::crd::{EKSUpgrade, EKSUpgradeStatus, StepHandle};
use crate::error::{self, KuoError};
use crate::executor::StepJournal;

/// Attempts per status write before giving up on conflicts.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[async_trait]
pub trait UpgradeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<EKSUpgrade>>;

    /// Replace the status of `object` with `status`.
    ///
    /// `base` is the status `status` was derived from. Fails with
    /// `StatusConflict` when `object` is no longer the latest version.
    async fn replace_status(
        &self,
        object: &EKSUpgrade,
        base: &EKSUpgradeStatus,
        status: &EKSUpgradeStatus,
    ) -> Result<EKSUpgrade>;
}

/// Store backed by the Kubernetes API server.
pub struct KubeStore {
    api: Api<EKSUpgrade>,
}

impl KubeStore {
    pub const fn new(api: Api<EKSUpgrade>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl UpgradeStore for KubeStore {
    async fn get(&self, name: &str) -> Result<Option<EKSUpgrade>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| KuoError::KubernetesApi(format!("Failed to get EKSUpgrade {name}: {e}")).into())
    }

    async fn replace_status(
        &self,
        object: &EKSUpgrade,
        base: &EKSUpgradeStatus,
        status: &EKSUpgradeStatus,
    ) -> Result<EKSUpgrade> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": object.metadata.resource_version },
            "status": merge_diff(&serde_json::to_value(base)?, &serde_json::to_value(status)?),
        });
        debug!(
            "Patching status for {}: phase={:?}",
            name,
            status.phase
        );

        match self
            .api
            .patch_status(&name, &PatchParams::apply("kuo"), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(KuoError::StatusConflict(name).into())
            }
            Err(e) => Err(KuoError::KubernetesApi(format!(
                "Failed to patch status of {name}: {e}"
            ))
            .into()),
        }
    }
}

/// JSON merge patch (RFC 7396) turning `base` into `target`.
///
/// Keys missing from `target` are sent as `null`; arrays are replaced whole.
pub fn merge_diff(base: &Value, target: &Value) -> Value {
    match (base, target) {
        (Value::Object(base), Value::Object(target)) => {
            let mut patch = Map::new();
            for (key, value) in target {
                match base.get(key) {
                    Some(old) if old == value => {}
                    Some(old @ Value::Object(_)) if value.is_object() => {
                        patch.insert(key.clone(), merge_diff(old, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in base.keys() {
                if !target.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => target.clone(),
    }
}

/// Writes the status of one `EKSUpgrade` during a reconcile.
///
/// Tracks the last status known to be stored. On a conflict the object is
/// re-read: if its status is still the one this writer last saw, the write is
/// applied again on the fresh version; otherwise the conflict is returned.
pub struct StatusWriter {
    store: Arc<dyn UpgradeStore>,
    object: EKSUpgrade,
    base: EKSUpgradeStatus,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn UpgradeStore>, object: EKSUpgrade) -> Self {
        let base = object.status.clone().unwrap_or_default();
        Self {
            store,
            object,
            base,
        }
    }

    /// Last status known to be stored.
    pub const fn base(&self) -> &EKSUpgradeStatus {
        &self.base
    }

    pub const fn object(&self) -> &EKSUpgrade {
        &self.object
    }

    pub async fn write(&mut self, status: &EKSUpgradeStatus) -> Result<()> {
        if *status == self.base {
            return Ok(());
        }

        let name = self.object.metadata.name.clone().unwrap_or_default();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self
                .store
                .replace_status(&self.object, &self.base, status)
                .await
            {
                Ok(updated) => {
                    self.object = updated;
                    self.base = status.clone();
                    return Ok(());
                }
                Err(e) if matches!(error::find(&e), Some(KuoError::StatusConflict(_))) => {
                    let Some(latest) = self.store.get(&name).await? else {
                        return Err(e);
                    };
                    if latest.status.clone().unwrap_or_default() != self.base {
                        warn!("Status of {} changed concurrently, not overwriting", name);
                        return Err(e);
                    }
                    debug!(
                        "Status write for {} conflicted (attempt {}), retrying on fresh version",
                        name, attempt
                    );
                    self.object = latest;
                }
                Err(e) => return Err(e),
            }
        }
        Err(KuoError::StatusConflict(name).into())
    }
}

#[async_trait]
impl StepJournal for StatusWriter {
    async fn checkpoint(&mut self, handles: &BTreeMap<String, StepHandle>) -> Result<()> {
        let mut status = self.base.clone();
        status.step_handles.clone_from(handles);
        self.write(&status).await
    }
}
