//! In-memory fakes of the store, EKS, disruption budget and STS APIs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::cloud::{CloudConnector, CloudSession, DisruptionBudgetApi, EksApi};
use crate::credentials::{Credentials, IdentityApi, TemporaryCredentials};
use crate::crd::{
    AwsIdentity, EKSUpgrade, EKSUpgradeSpec, EKSUpgradeStatus, StepHandle, UpgradePhase,
};
use crate::eks::{
    AddonInfo, ClusterInfo, InsightFinding, InsightsSummary, NodeGroupInfo, UpdateInfo,
    UpdateScope, UpdateStatus,
};
use crate::error::KuoError;
use crate::executor::StepJournal;
use crate::k8s::DisruptionBudget;
use crate::notify::{Notifier, PhaseEvent, PhaseEventKind};
use crate::store::{UpgradeStore, merge_diff};

pub const REGION: &str = "ap-northeast-2";
const OPERATOR_ACCOUNT: &str = "999988887777";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

pub fn spec(cluster: &str, target: &str) -> EKSUpgradeSpec {
    EKSUpgradeSpec {
        cluster_name: cluster.to_string(),
        target_version: target.to_string(),
        region: REGION.to_string(),
        assume_role_arn: None,
        addon_versions: None,
        skip_pdb_check: false,
        dry_run: false,
        timeouts: None,
        notification: None,
    }
}

pub fn upgrade(name: &str, target: &str) -> EKSUpgrade {
    EKSUpgrade::new(name, spec("prod", target))
}

pub fn blocking_budget(namespace: &str, name: &str) -> DisruptionBudget {
    DisruptionBudget {
        namespace: namespace.to_string(),
        name: name.to_string(),
        disruptions_allowed: 0,
        expected_pods: 1,
    }
}

// ============================================================================
// Step journal
// ============================================================================

#[derive(Default)]
pub struct MemoryJournal {
    pub checkpoints: Vec<BTreeMap<String, StepHandle>>,
}

#[async_trait]
impl StepJournal for MemoryJournal {
    async fn checkpoint(&mut self, handles: &BTreeMap<String, StepHandle>) -> Result<()> {
        self.checkpoints.push(handles.clone());
        Ok(())
    }
}

// ============================================================================
// EKS
// ============================================================================

struct MockUpdate {
    scope: UpdateScope,
    info: UpdateInfo,
    polls: usize,
}

#[derive(Default)]
struct EksState {
    version: String,
    deletion_protection: Option<bool>,
    addons: Vec<AddonInfo>,
    addon_versions: HashMap<String, Vec<String>>,
    nodegroups: Vec<NodeGroupInfo>,
    insights: InsightsSummary,
    polls_to_complete: usize,
    failure: Option<String>,
    describe_failure: Option<String>,
    throttled_issues: Vec<UpdateScope>,
    updates: Vec<MockUpdate>,
    cluster_updates: Vec<String>,
    addon_updates: Vec<(String, String)>,
    nodegroup_updates: Vec<(String, String)>,
}

/// EKS fake. Updates complete after `polls_to_complete` in-progress polls.
pub struct MockEks {
    state: Mutex<EksState>,
    pub update_calls: AtomicUsize,
    pub describe_update_calls: AtomicUsize,
    describe_cluster_calls: AtomicUsize,
}

impl MockEks {
    pub fn new(version: &str) -> Self {
        Self {
            state: Mutex::new(EksState {
                version: version.to_string(),
                deletion_protection: Some(true),
                ..Default::default()
            }),
            update_calls: AtomicUsize::new(0),
            describe_update_calls: AtomicUsize::new(0),
            describe_cluster_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_addon(self, name: &str, current: &str, versions: &[&str]) -> Self {
        {
            let mut state = lock(&self.state);
            state.addons.push(AddonInfo {
                name: name.to_string(),
                current_version: current.to_string(),
            });
            state.addon_versions.insert(
                name.to_string(),
                versions.iter().map(ToString::to_string).collect(),
            );
        }
        self
    }

    pub fn with_nodegroup(self, name: &str, version: &str) -> Self {
        lock(&self.state).nodegroups.push(NodeGroupInfo {
            name: name.to_string(),
            version: Some(version.to_string()),
        });
        self
    }

    pub fn with_deletion_protection(self, enabled: Option<bool>) -> Self {
        lock(&self.state).deletion_protection = enabled;
        self
    }

    pub fn add_critical_insight(&self, name: &str) {
        let mut state = lock(&self.state);
        let id = format!("insight-{}", state.insights.critical.len() + 1);
        state.insights.total += 1;
        state.insights.critical.push(InsightFinding {
            id,
            name: name.to_string(),
            category: "UPGRADE_READINESS".to_string(),
            status: "ERROR".to_string(),
            description: name.to_string(),
            recommendation: None,
            resources: vec![],
        });
    }

    pub fn set_polls_to_complete(&self, polls: usize) {
        lock(&self.state).polls_to_complete = polls;
    }

    /// Every update polled from now on ends `Failed` with `message`.
    pub fn fail_updates_with(&self, message: &str) {
        lock(&self.state).failure = Some(message.to_string());
    }

    /// `DescribeCluster` fails with `message` until cleared with `None`.
    pub fn fail_describe_cluster(&self, message: Option<&str>) {
        lock(&self.state).describe_failure = message.map(str::to_string);
    }

    /// The next update for `scope` is throttled once before reaching EKS.
    pub fn throttle_next_issue(&self, scope: UpdateScope) {
        lock(&self.state).throttled_issues.push(scope);
    }

    /// Record an update as if an earlier run had started it.
    pub fn seed_update(&self, scope: &UpdateScope, version: &str, created_at: DateTime<Utc>) -> String {
        let mut state = lock(&self.state);
        push_update(&mut state, scope, version, created_at)
    }

    pub fn cluster_update_versions(&self) -> Vec<String> {
        lock(&self.state).cluster_updates.clone()
    }

    pub fn addon_updates(&self) -> Vec<(String, String)> {
        lock(&self.state).addon_updates.clone()
    }

    pub fn nodegroup_updates(&self) -> Vec<(String, String)> {
        lock(&self.state).nodegroup_updates.clone()
    }

    pub fn describe_cluster_calls(&self) -> usize {
        self.describe_cluster_calls.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> String {
        lock(&self.state).version.clone()
    }

    fn issue(&self, scope: &UpdateScope, version: &str) -> Result<String> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if let Some(pos) = state.throttled_issues.iter().position(|s| s == scope) {
            state.throttled_issues.remove(pos);
            return Err(KuoError::AwsThrottled(
                "mock".to_string(),
                "ThrottlingException: Rate exceeded".to_string(),
            )
            .into());
        }
        match scope {
            UpdateScope::Cluster => state.cluster_updates.push(version.to_string()),
            UpdateScope::Addon(name) => {
                state.addon_updates.push((name.clone(), version.to_string()));
            }
            UpdateScope::Nodegroup(name) => {
                state.nodegroup_updates.push((name.clone(), version.to_string()));
            }
        }
        Ok(push_update(&mut state, scope, version, Utc::now()))
    }
}

fn push_update(
    state: &mut EksState,
    scope: &UpdateScope,
    version: &str,
    created_at: DateTime<Utc>,
) -> String {
    let id = format!("update-{}", state.updates.len() + 1);
    let update_type = match scope {
        UpdateScope::Addon(_) => "AddonUpdate",
        UpdateScope::Cluster | UpdateScope::Nodegroup(_) => "VersionUpdate",
    };
    state.updates.push(MockUpdate {
        scope: scope.clone(),
        info: UpdateInfo {
            id: id.clone(),
            status: UpdateStatus::InProgress,
            update_type: update_type.to_string(),
            version: Some(version.to_string()),
            created_at: Some(created_at),
            errors: vec![],
        },
        polls: 0,
    });
    id
}

fn not_found(what: &str) -> anyhow::Error {
    KuoError::AwsRejected(
        "mock".to_string(),
        format!("ResourceNotFoundException: {what} not found"),
    )
    .into()
}

#[async_trait]
impl EksApi for MockEks {
    async fn describe_cluster(&self, cluster: &str) -> Result<ClusterInfo> {
        self.describe_cluster_calls.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        if let Some(message) = &state.describe_failure {
            return Err(KuoError::AwsThrottled("mock".to_string(), message.clone()).into());
        }
        Ok(ClusterInfo {
            name: cluster.to_string(),
            version: state.version.clone(),
            region: REGION.to_string(),
            endpoint: Some(format!("https://{cluster}.eks.amazonaws.com")),
            ca_data: None,
            deletion_protection: state.deletion_protection,
        })
    }

    async fn update_cluster_version(&self, _cluster: &str, version: &str) -> Result<String> {
        self.issue(&UpdateScope::Cluster, version)
    }

    async fn list_addons(&self, _cluster: &str) -> Result<Vec<AddonInfo>> {
        Ok(lock(&self.state).addons.clone())
    }

    async fn addon_versions(&self, addon: &str, _k8s_version: &str) -> Result<Vec<String>> {
        Ok(lock(&self.state)
            .addon_versions
            .get(addon)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_addon(&self, _cluster: &str, addon: &str, version: &str) -> Result<String> {
        self.issue(&UpdateScope::Addon(addon.to_string()), version)
    }

    async fn list_nodegroups(&self, _cluster: &str) -> Result<Vec<NodeGroupInfo>> {
        Ok(lock(&self.state).nodegroups.clone())
    }

    async fn update_nodegroup_version(
        &self,
        _cluster: &str,
        nodegroup: &str,
        version: &str,
    ) -> Result<String> {
        self.issue(&UpdateScope::Nodegroup(nodegroup.to_string()), version)
    }

    async fn describe_update(
        &self,
        _cluster: &str,
        _scope: &UpdateScope,
        update_id: &str,
    ) -> Result<UpdateInfo> {
        self.describe_update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        let polls_to_complete = state.polls_to_complete;
        let failure = state.failure.clone();
        let update = state
            .updates
            .iter_mut()
            .find(|u| u.info.id == update_id)
            .ok_or_else(|| not_found(update_id))?;

        if update.info.status == UpdateStatus::InProgress {
            if let Some(message) = failure {
                update.info.status = UpdateStatus::Failed;
                update.info.errors = vec![message];
            } else if update.polls < polls_to_complete {
                update.polls += 1;
            } else {
                update.info.status = UpdateStatus::Successful;
            }
        }

        let info = update.info.clone();
        let is_cluster = update.scope == UpdateScope::Cluster;
        if is_cluster
            && info.status == UpdateStatus::Successful
            && let Some(version) = &info.version
        {
            state.version.clone_from(version);
        }
        Ok(info)
    }

    async fn list_updates(&self, _cluster: &str, scope: &UpdateScope) -> Result<Vec<UpdateInfo>> {
        Ok(lock(&self.state)
            .updates
            .iter()
            .filter(|u| &u.scope == scope)
            .map(|u| u.info.clone())
            .collect())
    }

    async fn list_insights(&self, _cluster: &str) -> Result<InsightsSummary> {
        Ok(lock(&self.state).insights.clone())
    }
}

// ============================================================================
// Disruption budgets and connector
// ============================================================================

#[derive(Default)]
pub struct MockBudgets {
    budgets: Mutex<Vec<DisruptionBudget>>,
    failing: AtomicBool,
    denied: AtomicBool,
    list_calls: AtomicUsize,
}

impl MockBudgets {
    pub fn set(&self, budgets: Vec<DisruptionBudget>) {
        *lock(&self.budgets) = budgets;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fail_with_api_error(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// The target cluster answers 403 until healed.
    pub fn deny_access(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
        self.denied.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DisruptionBudgetApi for MockBudgets {
    async fn list_disruption_budgets(&self) -> Result<Vec<DisruptionBudget>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(crate::k8s::pdb::classify_status(
                Some(403),
                "Failed to list PDBs: Forbidden".to_string(),
            )
            .into());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(KuoError::KubernetesApi(
                "Failed to list PDBs: connection refused".to_string(),
            )
            .into());
        }
        Ok(lock(&self.budgets).clone())
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pub eks: Arc<MockEks>,
    pub budgets: Arc<MockBudgets>,
    clients_built: Arc<AtomicUsize>,
    roles: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockConnector {
    pub fn new(eks: MockEks) -> Self {
        Self {
            eks: Arc::new(eks),
            budgets: Arc::new(MockBudgets::default()),
            clients_built: Arc::new(AtomicUsize::new(0)),
            roles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn budget_clients_built(&self) -> usize {
        self.clients_built.load(Ordering::SeqCst)
    }

    /// Role ARN of every EKS client built, `None` for ambient credentials.
    pub fn roles_used(&self) -> Vec<Option<String>> {
        lock(&self.roles).clone()
    }
}

#[async_trait]
impl CloudConnector for MockConnector {
    async fn eks(&self, _region: &str, credentials: &Credentials) -> Result<Arc<dyn EksApi>> {
        lock(&self.roles).push(credentials.role_arn().map(str::to_string));
        Ok(self.eks.clone())
    }

    async fn disruption_budgets(
        &self,
        _cluster: &ClusterInfo,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn DisruptionBudgetApi>> {
        self.clients_built.fetch_add(1, Ordering::SeqCst);
        Ok(self.budgets.clone())
    }
}

pub async fn session_for(connector: &MockConnector) -> CloudSession {
    CloudSession::open(Arc::new(connector.clone()), REGION, Credentials::Ambient)
        .await
        .unwrap()
}

// ============================================================================
// STS
// ============================================================================

pub struct MockIdentity {
    pub assume_calls: AtomicUsize,
    pub identity_calls: AtomicUsize,
    pub fail_assume: AtomicBool,
    lifetime: Mutex<TimeDelta>,
    delay: Duration,
    last_assume: Mutex<Option<(String, Vec<(String, String)>)>>,
}

impl Default for MockIdentity {
    fn default() -> Self {
        Self {
            assume_calls: AtomicUsize::new(0),
            identity_calls: AtomicUsize::new(0),
            fail_assume: AtomicBool::new(false),
            lifetime: Mutex::new(TimeDelta::hours(1)),
            delay: Duration::ZERO,
            last_assume: Mutex::new(None),
        }
    }
}

impl MockIdentity {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn set_lifetime(&self, lifetime: TimeDelta) {
        *lock(&self.lifetime) = lifetime;
    }

    pub fn last_assume(&self) -> Option<(String, Vec<(String, String)>)> {
        lock(&self.last_assume).clone()
    }
}

#[async_trait]
impl IdentityApi for MockIdentity {
    async fn caller_identity(
        &self,
        _region: &str,
        credentials: &Credentials,
    ) -> Result<AwsIdentity> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match credentials.role_arn() {
            None => AwsIdentity {
                account_id: OPERATOR_ACCOUNT.to_string(),
                arn: format!("arn:aws:sts::{OPERATOR_ACCOUNT}:assumed-role/kuo-operator/1700000000"),
            },
            Some(role_arn) => {
                // arn:aws:iam::<account>:role/<name>
                let account = role_arn.split(':').nth(4).unwrap_or_default();
                let role = role_arn.rsplit('/').next().unwrap_or_default();
                AwsIdentity {
                    account_id: account.to_string(),
                    arn: format!("arn:aws:sts::{account}:assumed-role/{role}/kuo-kuo-operator"),
                }
            }
        })
    }

    async fn assume_role(
        &self,
        _region: &str,
        role_arn: &str,
        session_name: &str,
        tags: &[(String, String)],
    ) -> Result<TemporaryCredentials> {
        self.assume_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_assume) = Some((session_name.to_string(), tags.to_vec()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_assume.load(Ordering::SeqCst) {
            return Err(KuoError::AwsCredentials(
                "mock".to_string(),
                format!("AccessDenied: not authorized to perform sts:AssumeRole on {role_arn}"),
            )
            .into());
        }
        let lifetime = *lock(&self.lifetime);
        Ok(TemporaryCredentials {
            access_key_id: "ASIAMOCK".to_string(),
            secret_access_key: SecretString::from("secret".to_string()),
            session_token: SecretString::from("token".to_string()),
            expiration: Utc::now() + lifetime,
        })
    }
}

// ============================================================================
// Declared-state store
// ============================================================================

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, EKSUpgrade>,
    resource_version: u64,
    writes: usize,
    phases: HashMap<String, Vec<UpgradePhase>>,
}

impl StoreState {
    fn bump(&mut self, name: &str) {
        self.resource_version += 1;
        let rv = self.resource_version.to_string();
        if let Some(obj) = self.objects.get_mut(name) {
            obj.metadata.resource_version = Some(rv);
        }
    }
}

/// Store with resource-version preconditions and merge-patch status writes.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn insert(&self, mut object: EKSUpgrade) -> EKSUpgrade {
        let name = object.metadata.name.clone().unwrap();
        if object.metadata.generation.is_none() {
            object.metadata.generation = Some(1);
        }
        let mut state = lock(&self.state);
        state.objects.insert(name.clone(), object);
        state.bump(&name);
        state.objects[&name].clone()
    }

    /// Metadata-only change.
    pub fn touch(&self, name: &str) {
        lock(&self.state).bump(name);
    }

    /// Status change made by someone else.
    pub fn set_status(&self, name: &str, status: EKSUpgradeStatus) {
        let mut state = lock(&self.state);
        state.objects.get_mut(name).unwrap().status = Some(status);
        state.bump(name);
    }

    /// Spec change: bumps the generation.
    pub fn update_spec(&self, name: &str, update: impl FnOnce(&mut EKSUpgradeSpec)) {
        let mut state = lock(&self.state);
        let obj = state.objects.get_mut(name).unwrap();
        update(&mut obj.spec);
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
        state.bump(name);
    }

    pub fn delete(&self, name: &str) {
        lock(&self.state).objects.remove(name);
    }

    pub fn status(&self, name: &str) -> EKSUpgradeStatus {
        lock(&self.state).objects[name].status.clone().unwrap_or_default()
    }

    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    /// Distinct phases the stored status went through, in order.
    pub fn phases(&self, name: &str) -> Vec<UpgradePhase> {
        lock(&self.state).phases.get(name).cloned().unwrap_or_default()
    }
}

/// Apply an RFC 7396 merge patch.
fn apply_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(key);
            } else {
                apply_merge(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl UpgradeStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<EKSUpgrade>> {
        Ok(lock(&self.state).objects.get(name).cloned())
    }

    async fn replace_status(
        &self,
        object: &EKSUpgrade,
        base: &EKSUpgradeStatus,
        status: &EKSUpgradeStatus,
    ) -> Result<EKSUpgrade> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let mut state = lock(&self.state);
        let stored = state
            .objects
            .get_mut(&name)
            .ok_or_else(|| KuoError::KubernetesApi(format!("EKSUpgrade {name} not found")))?;
        if stored.metadata.resource_version != object.metadata.resource_version {
            return Err(KuoError::StatusConflict(name).into());
        }

        let patch = merge_diff(&serde_json::to_value(base)?, &serde_json::to_value(status)?);
        let mut current = serde_json::to_value(stored.status.clone().unwrap_or_default())?;
        apply_merge(&mut current, &patch);
        let updated: EKSUpgradeStatus = serde_json::from_value(current)?;
        let phase = updated.phase();
        stored.status = Some(updated);

        state.writes += 1;
        let history = state.phases.entry(name.clone()).or_default();
        if history.last() != Some(&phase) {
            history.push(phase);
        }
        state.bump(&name);
        Ok(state.objects[&name].clone())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Records every event it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(PhaseEventKind, UpgradePhase)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(PhaseEventKind, UpgradePhase)> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn notify(&self, event: &PhaseEvent) -> Result<()> {
        lock(&self.events).push((event.kind, event.phase()));
        Ok(())
    }
}
