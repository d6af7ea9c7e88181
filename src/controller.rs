//! EKSUpgrade controller - reconcile dispatch and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use kube::Api;
use kube::runtime::watcher::{self, Event};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffConfig;
use crate::cloud::{CloudConnector, CloudSession};
use crate::credentials::CredentialBroker;
use crate::crd::{AuthState, EKSUpgrade, EKSUpgradeSpec, EKSUpgradeStatus, UpgradePhase};
use crate::error::{self, KuoError};
use crate::notify::{self, Notifier, PhaseEvent};
use crate::phases;
use crate::queue::{Action, WorkQueue};
use crate::status;
use crate::store::{StatusWriter, UpgradeStore};
use crate::telemetry::metrics::Metrics;

/// Delay before the next phase runs after a transition.
const TRANSITION_DELAY: Duration = Duration::from_millis(100);

const AWS_AUTHENTICATED: &str = "AWSAuthenticated";

/// Shared context for the controller.
pub struct Context {
    pub store: Arc<dyn UpgradeStore>,
    pub broker: Arc<CredentialBroker>,
    pub connector: Arc<dyn CloudConnector>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub metrics: Arc<Metrics>,
    pub backoff: BackoffConfig,
    pub auth_backoff: BackoffConfig,
}

/// Reconcile the `EKSUpgrade` named `name` and record reconcile metrics.
pub async fn reconcile(name: &str, ctx: &Context) -> Result<Action> {
    let Some(obj) = ctx.store.get(name).await? else {
        debug!("EKSUpgrade {} no longer exists", name);
        return Ok(Action::AwaitChange);
    };

    let cluster = obj.spec.cluster_name.clone();
    let region = obj.spec.region.clone();
    let started = Instant::now();
    let result = reconcile_upgrade(obj, ctx).await;
    let outcome = if result.is_ok() { "success" } else { "error" };
    ctx.metrics
        .record_reconcile(&cluster, &region, outcome, started.elapsed().as_secs_f64());
    result
}

/// Entry point for the worker pool. Errors never escape: they become a requeue.
pub async fn reconcile_key(name: String, ctx: Arc<Context>) -> Action {
    match reconcile(&name, &ctx).await {
        Ok(action) => action,
        Err(e) => {
            let delay = ctx.backoff.initial_delay;
            warn!("Reconcile of {} failed, retrying in {:?}: {:#}", name, delay, e);
            Action::Requeue(delay)
        }
    }
}

/// Phase-based state machine: runs at most one phase step and persists the result.
async fn reconcile_upgrade(obj: EKSUpgrade, ctx: &Context) -> Result<Action> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let generation = obj.metadata.generation.unwrap_or(0);
    let spec = obj.spec.clone();
    let mut writer = StatusWriter::new(Arc::clone(&ctx.store), obj);

    let stored = writer.base().clone();
    let phase = stored.phase();
    let mut current = stored.clone();

    if stored.observed_generation != generation {
        if phase.is_mutating() {
            info!(
                "Spec of {} changed to generation {} during {}, applying it after the run finishes",
                name, generation, phase
            );
        } else {
            info!(
                "Starting generation {} of {} (was {})",
                generation, name, stored.observed_generation
            );
            current = status::reset_for_generation(&stored, generation);
        }
    } else if phase.is_terminal() {
        return Ok(Action::AwaitChange);
    }

    writer.write(&current).await?;
    info!("Reconciling {} (phase: {})", name, current.phase());

    let role_arn = spec.assume_role_arn.as_deref();
    let credentials = match ctx.broker.credentials(&spec.region, role_arn).await {
        Ok(credentials) => credentials,
        Err(e) => return on_error(&mut writer, ctx, role_arn, &e).await,
    };

    let expected = if credentials.role_arn().is_some() {
        AuthState::AssumeRoleSuccess
    } else {
        AuthState::IdentityVerified
    };
    if current.identity.is_none() || current.auth_state != expected {
        match ctx.broker.caller_identity(&spec.region, &credentials).await {
            Ok(identity) => {
                info!(
                    "AWS identity verified for {}: account={}, arn={}",
                    name, identity.account_id, identity.arn
                );
                current.auth_state = expected;
                status::set_condition(
                    &mut current,
                    AWS_AUTHENTICATED,
                    "True",
                    &expected.to_string(),
                    Some(format!("account={}", identity.account_id)),
                );
                current.identity = Some(identity);
                writer.write(&current).await?;
            }
            Err(e) => return on_error(&mut writer, ctx, role_arn, &e).await,
        }
    }

    let session = match CloudSession::open(Arc::clone(&ctx.connector), &spec.region, credentials).await {
        Ok(session) => session,
        Err(e) => return on_error(&mut writer, ctx, role_arn, &e).await,
    };

    match run_phase(&spec, &current, &session, &mut writer).await {
        Ok((mut next, requeue)) => {
            next.transient_retries = 0;
            if next
                .conditions
                .iter()
                .any(|c| c.r#type == "Ready" && c.reason == "TransientError")
            {
                status::set_condition(&mut next, "Ready", "False", "UpgradeInProgress", None);
            }
            writer.write(&next).await?;
            observe(ctx, &writer, &current, &next);

            Ok(match requeue {
                Some(d) if d.is_zero() => Action::Requeue(TRANSITION_DELAY),
                Some(d) => Action::Requeue(d),
                None => Action::AwaitChange,
            })
        }
        Err(e) => on_error(&mut writer, ctx, role_arn, &e).await,
    }
}

async fn run_phase(
    spec: &EKSUpgradeSpec,
    current: &EKSUpgradeStatus,
    session: &CloudSession,
    writer: &mut StatusWriter,
) -> Result<(EKSUpgradeStatus, Option<Duration>)> {
    match current.phase() {
        UpgradePhase::Pending => {
            let mut next = current.clone();
            next.started_at = Some(Utc::now());
            status::set_phase(&mut next, UpgradePhase::Planning);
            Ok((next, Some(Duration::ZERO)))
        }
        UpgradePhase::Planning => {
            phases::planning::execute(spec, current, session.eks.as_ref()).await
        }
        UpgradePhase::PreflightChecking => phases::preflight::execute(spec, current, session).await,
        UpgradePhase::UpgradingControlPlane => {
            phases::control_plane::execute(spec, current, session, writer).await
        }
        UpgradePhase::UpgradingAddons => {
            phases::addons::execute(spec, current, session, writer).await
        }
        UpgradePhase::UpgradingNodeGroups => {
            phases::nodegroups::execute(spec, current, session, writer).await
        }
        UpgradePhase::Completed | UpgradePhase::Failed => Ok((current.clone(), None)),
    }
}

/// Error policy. Starts from the last stored status, so step handles
/// checkpointed before the error are kept.
async fn on_error(
    writer: &mut StatusWriter,
    ctx: &Context,
    role_arn: Option<&str>,
    err: &anyhow::Error,
) -> Result<Action> {
    let name = writer.object().metadata.name.clone().unwrap_or_default();
    let base = writer.base().clone();
    let mut next = base.clone();
    let kind = error::find(err);

    let action = if kind.is_some_and(KuoError::is_auth) {
        warn!("Authentication failed for {}, will retry: {:#}", name, err);
        if let Some(role_arn) = role_arn {
            ctx.broker.invalidate(role_arn);
        }
        let (state, reason) = if role_arn.is_some() {
            (AuthState::AssumeRoleFailed, "AssumeRoleFailed")
        } else {
            (AuthState::Unverified, "IdentityVerificationFailed")
        };
        next.auth_state = state;
        next.identity = None;
        status::set_condition(
            &mut next,
            AWS_AUTHENTICATED,
            "False",
            reason,
            Some(format!("{err:#}")),
        );
        next.transient_retries = next.transient_retries.saturating_add(1);
        Action::Requeue(ctx.auth_backoff.delay_for_attempt(next.transient_retries - 1))
    } else if kind.is_some_and(KuoError::is_transient) {
        next.transient_retries = next.transient_retries.saturating_add(1);
        let delay = ctx.backoff.delay_for_attempt(next.transient_retries - 1);
        warn!(
            "Transient error for {} (attempt {}), retrying in {:?}: {:#}",
            name, next.transient_retries, delay, err
        );
        status::set_condition(
            &mut next,
            "Ready",
            "False",
            "TransientError",
            Some(format!("{err:#}")),
        );
        Action::Requeue(delay)
    } else {
        error!("Upgrade {} failed: {:#}", name, err);
        status::set_failed(&mut next, format!("{err:#}"));
        Action::AwaitChange
    };

    match writer.write(&next).await {
        Ok(()) => {
            observe(ctx, writer, &base, &next);
            Ok(action)
        }
        Err(write_err) => {
            warn!("Failed to record error status for {}: {:#}", name, write_err);
            Ok(Action::Requeue(ctx.backoff.initial_delay))
        }
    }
}

/// Metrics and notifications for a persisted status change.
fn observe(ctx: &Context, writer: &StatusWriter, before: &EKSUpgradeStatus, after: &EKSUpgradeStatus) {
    let upgrade = writer.object();
    let cluster = &upgrade.spec.cluster_name;
    let region = &upgrade.spec.region;

    for (key, handle) in &after.step_handles {
        let was = before.handle(key).map(|h| h.state);
        if handle.state.is_terminal() && was != Some(handle.state) {
            ctx.metrics.record_step(cluster, region, key, handle.state);
        }
    }

    let (from, to) = (before.phase(), after.phase());
    if from == to {
        return;
    }
    info!(
        "{} moved from {} to {}",
        upgrade.metadata.name.as_deref().unwrap_or("unknown"),
        from,
        to
    );
    ctx.metrics
        .record_transition(cluster, region, from, to, before.phase_started_at);
    let event = PhaseEvent::new(Arc::new(upgrade.clone()), from, after.clone());
    notify::dispatch(&ctx.notifiers, &event);
}

/// Feed `EKSUpgrade` changes into `queue` until `shutdown` flips.
///
/// `on_synced` runs once the initial listing has been queued.
pub async fn watch_upgrades(
    api: Api<EKSUpgrade>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
    on_synced: impl Fn() + Send,
) {
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("EKSUpgrade watcher shutting down");
                break;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(obj) | Event::InitApply(obj))) => {
                        if let Some(name) = obj.metadata.name.as_deref() {
                            queue.add(name);
                        }
                    }
                    Some(Ok(Event::Delete(obj))) => {
                        debug!(
                            "EKSUpgrade {} deleted",
                            obj.metadata.name.as_deref().unwrap_or("unknown")
                        );
                    }
                    Some(Ok(Event::Init)) => debug!("EKSUpgrade watcher listing"),
                    Some(Ok(Event::InitDone)) => {
                        info!("EKSUpgrade watcher synced");
                        on_synced();
                    }
                    Some(Err(e)) => warn!("EKSUpgrade watch error: {}", e),
                    None => {
                        warn!("EKSUpgrade watch stream ended");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CompletionKind, StepHandle, StepState, UpgradePlan, control_plane_key, nodegroup_key,
    };
    use crate::eks::UpdateScope;
    use crate::notify::PhaseEventKind;
    use crate::testing::{
        MemoryStore, MockConnector, MockEks, MockIdentity, RecordingNotifier, blocking_budget,
        upgrade,
    };
    use chrono::TimeDelta;
    use prometheus_client::registry::Registry;
    use std::sync::atomic::Ordering;

    const NAME: &str = "prod-upgrade";
    const ROLE: &str = "arn:aws:iam::111122223333:role/kuo-target";

    struct Harness {
        store: Arc<MemoryStore>,
        connector: MockConnector,
        identity: Arc<MockIdentity>,
        notifier: Arc<RecordingNotifier>,
        ctx: Context,
    }

    impl Harness {
        fn new(eks: MockEks, object: EKSUpgrade) -> Self {
            let store = Arc::new(MemoryStore::default());
            store.insert(object);
            let connector = MockConnector::new(eks);
            let identity = Arc::new(MockIdentity::default());
            let notifier = Arc::new(RecordingNotifier::default());
            let ctx = context(&store, &connector, &identity, &notifier);
            Self {
                store,
                connector,
                identity,
                notifier,
                ctx,
            }
        }

        /// Fresh broker and metrics over the same store and cloud, as after a restart.
        fn restart(&mut self) {
            self.ctx = context(&self.store, &self.connector, &self.identity, &self.notifier);
        }

        async fn step(&self) -> Action {
            reconcile(NAME, &self.ctx).await.unwrap()
        }

        /// Reconcile until the controller waits for a change.
        async fn run(&self) -> EKSUpgradeStatus {
            for _ in 0..50 {
                if self.step().await == Action::AwaitChange {
                    return self.status();
                }
            }
            panic!("no steady state, stuck in {}", self.status().phase());
        }

        async fn run_until(&self, phase: UpgradePhase) {
            for _ in 0..50 {
                if self.status().phase() == phase {
                    return;
                }
                self.step().await;
            }
            panic!("never reached {phase}");
        }

        fn status(&self) -> EKSUpgradeStatus {
            self.store.status(NAME)
        }

        fn eks(&self) -> &MockEks {
            &self.connector.eks
        }
    }

    fn context(
        store: &Arc<MemoryStore>,
        connector: &MockConnector,
        identity: &Arc<MockIdentity>,
        notifier: &Arc<RecordingNotifier>,
    ) -> Context {
        let mut registry = Registry::default();
        let backoff = BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        };
        Context {
            store: store.clone(),
            broker: Arc::new(CredentialBroker::new(identity.clone(), TimeDelta::minutes(5))),
            connector: Arc::new(connector.clone()),
            notifiers: vec![notifier.clone() as Arc<dyn Notifier>],
            metrics: Arc::new(Metrics::new(&mut registry)),
            auth_backoff: backoff.with_max_delay(Duration::from_secs(120)),
            backoff,
        }
    }

    fn cluster() -> MockEks {
        MockEks::new("1.31")
            .with_addon("vpc-cni", "v1.18.0-eksbuild.1", &["v1.19.2-eksbuild.1"])
            .with_nodegroup("ng-system", "1.31")
    }

    async fn notifications_delivered() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_multi_hop_upgrade_runs_every_phase_in_order() {
        let h = Harness::new(cluster(), upgrade(NAME, "1.34"));

        let status = h.run().await;

        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.completion, Some(CompletionKind::Upgraded));
        assert_eq!(status.current_version.as_deref(), Some("1.34"));
        assert_eq!(status.auth_state, AuthState::IdentityVerified);
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32", "1.33", "1.34"]);
        assert_eq!(h.eks().addon_updates(), vec![(
            "vpc-cni".to_string(),
            "v1.19.2-eksbuild.1".to_string()
        )]);
        assert_eq!(h.eks().nodegroup_updates(), vec![(
            "ng-system".to_string(),
            "1.34".to_string()
        )]);
        assert_eq!(h.store.phases(NAME), vec![
            UpgradePhase::Pending,
            UpgradePhase::Planning,
            UpgradePhase::PreflightChecking,
            UpgradePhase::UpgradingControlPlane,
            UpgradePhase::UpgradingAddons,
            UpgradePhase::UpgradingNodeGroups,
            UpgradePhase::Completed,
        ]);
        assert!(
            status
                .step_handles
                .values()
                .all(|handle| handle.state == StepState::Succeeded)
        );

        notifications_delivered().await;
        let events = h.notifier.events();
        assert_eq!(events.len(), 6);
        assert!(events.contains(&(PhaseEventKind::Started, UpgradePhase::Planning)));
        assert!(events.contains(&(PhaseEventKind::Completed, UpgradePhase::Completed)));

        // Terminal: nothing more happens until the spec changes.
        let writes = h.store.writes();
        assert_eq!(h.step().await, Action::AwaitChange);
        assert_eq!(h.store.writes(), writes);
    }

    #[tokio::test]
    async fn test_blocking_pdb_fails_before_any_mutation() {
        let h = Harness::new(cluster(), upgrade(NAME, "1.34"));
        h.connector
            .budgets
            .set(vec![blocking_budget("payments", "db")]);

        let status = h.run().await;

        assert_eq!(status.phase(), UpgradePhase::Failed);
        assert!(status.error_message.as_deref().unwrap().contains("payments/db"));
        assert_eq!(h.eks().update_calls.load(Ordering::SeqCst), 0);
        let ready = status.conditions.iter().find(|c| c.r#type == "Ready").unwrap();
        assert_eq!(ready.reason, "UpgradeFailed");

        notifications_delivered().await;
        assert!(
            h.notifier
                .events()
                .contains(&(PhaseEventKind::Failed, UpgradePhase::Failed))
        );
    }

    #[tokio::test]
    async fn test_restart_polls_running_update_instead_of_reissuing() {
        let mut h = Harness::new(cluster(), upgrade(NAME, "1.34"));
        h.eks().set_polls_to_complete(3);
        h.run_until(UpgradePhase::UpgradingControlPlane).await;
        for _ in 0..20 {
            if h.eks().cluster_update_versions().len() == 2 {
                break;
            }
            h.step().await;
        }
        // Second hop issued and polled once, still running.
        h.step().await;
        let hop = control_plane_key("1.32", "1.33");
        assert_eq!(h.status().handle(&hop).unwrap().state, StepState::InProgress);
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32", "1.33"]);
        let polls = h.eks().describe_update_calls.load(Ordering::SeqCst);

        h.restart();
        h.step().await;
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32", "1.33"]);
        assert_eq!(
            h.eks().describe_update_calls.load(Ordering::SeqCst),
            polls + 1
        );

        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32", "1.33", "1.34"]);
    }

    #[tokio::test]
    async fn test_partial_nodegroup_progress_retries_only_unresolved_target() {
        let eks = MockEks::new("1.32")
            .with_nodegroup("ng-a", "1.31")
            .with_nodegroup("ng-b", "1.31");
        let h = Harness::new(eks, upgrade(NAME, "1.32"));
        h.eks()
            .throttle_next_issue(UpdateScope::Nodegroup("ng-b".to_string()));

        for _ in 0..20 {
            if h.status().transient_retries > 0 {
                break;
            }
            h.step().await;
        }
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::UpgradingNodeGroups);
        assert_eq!(status.transient_retries, 1);
        assert_eq!(
            status.handle(&nodegroup_key("ng-a")).unwrap().state,
            StepState::Succeeded
        );
        assert!(status.handle(&nodegroup_key("ng-b")).is_none());
        assert_eq!(h.eks().nodegroup_updates(), vec![(
            "ng-a".to_string(),
            "1.32".to_string()
        )]);

        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.transient_retries, 0);
        assert_eq!(h.eks().nodegroup_updates(), vec![
            ("ng-a".to_string(), "1.32".to_string()),
            ("ng-b".to_string(), "1.32".to_string()),
        ]);
    }

    #[tokio::test]
    async fn test_issuing_intent_adopts_update_started_before_crash() {
        let h = Harness::new(MockEks::new("1.31"), upgrade(NAME, "1.32"));
        let update_id = h
            .eks()
            .seed_update(&UpdateScope::Cluster, "1.32", Utc::now());
        let key = &control_plane_key("1.31", "1.32");
        let mut status = EKSUpgradeStatus {
            phase: Some(UpgradePhase::UpgradingControlPlane),
            observed_generation: 1,
            current_version: Some("1.31".to_string()),
            plan: Some(UpgradePlan {
                current_version: "1.31".to_string(),
                target_version: "1.32".to_string(),
                hops: vec!["1.32".to_string()],
                addons: vec![],
                nodegroups: vec![],
            }),
            ..Default::default()
        };
        status.step_handles.insert(
            key.to_string(),
            StepHandle::issuing(Utc::now(), TimeDelta::minutes(30)),
        );
        h.store.set_status(NAME, status);

        assert_eq!(
            h.step().await,
            Action::Requeue(phases::control_plane::POLL_INTERVAL)
        );
        let handle = h.status().handle(key).cloned().unwrap();
        assert_eq!(handle.state, StepState::InProgress);
        assert_eq!(handle.operation_id, Some(update_id));

        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert!(h.eks().cluster_update_versions().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_completes_without_mutations() {
        let mut object = upgrade(NAME, "1.34");
        object.spec.dry_run = true;
        let h = Harness::new(cluster(), object);

        let status = h.run().await;

        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.completion, Some(CompletionKind::DryRun));
        assert_eq!(status.plan.as_ref().unwrap().hops, vec!["1.32", "1.33", "1.34"]);
        assert!(status.step_handles.is_empty());
        assert_eq!(h.eks().update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_pdb_check_never_lists_budgets() {
        let mut object = upgrade(NAME, "1.32");
        object.spec.skip_pdb_check = true;
        let h = Harness::new(cluster(), object);
        h.connector
            .budgets
            .set(vec![blocking_budget("payments", "db")]);

        let status = h.run().await;

        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(h.connector.budgets.list_calls(), 0);
        assert_eq!(h.connector.budget_clients_built(), 0);
    }

    #[tokio::test]
    async fn test_sync_mode_skips_control_plane() {
        let eks = MockEks::new("1.33")
            .with_addon("coredns", "v1.11.1-eksbuild.1", &["v1.11.4-eksbuild.2"])
            .with_nodegroup("ng-system", "1.32");
        let h = Harness::new(eks, upgrade(NAME, "1.33"));

        let status = h.run().await;

        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert!(h.eks().cluster_update_versions().is_empty());
        assert_eq!(h.eks().addon_updates().len(), 1);
        assert_eq!(h.eks().nodegroup_updates(), vec![(
            "ng-system".to_string(),
            "1.33".to_string()
        )]);
        assert!(
            !h.store
                .phases(NAME)
                .contains(&UpgradePhase::UpgradingControlPlane)
        );
    }

    #[tokio::test]
    async fn test_assume_role_failure_is_retried_not_terminal() {
        let mut object = upgrade(NAME, "1.32");
        object.spec.assume_role_arn = Some(ROLE.to_string());
        let h = Harness::new(cluster(), object);
        h.identity.fail_assume.store(true, Ordering::SeqCst);

        let mut delays = Vec::new();
        for _ in 0..8 {
            let Action::Requeue(delay) = h.step().await else {
                panic!("authentication failure must be retried");
            };
            delays.push(delay);
        }

        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::Pending);
        assert_eq!(status.auth_state, AuthState::AssumeRoleFailed);
        assert_eq!(status.transient_retries, 8);
        let auth = status
            .conditions
            .iter()
            .find(|c| c.r#type == AWS_AUTHENTICATED)
            .unwrap();
        assert_eq!(auth.status, "False");
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[7], Duration::from_secs(120));

        h.identity.fail_assume.store(false, Ordering::SeqCst);
        h.step().await;
        let status = h.status();
        assert_eq!(status.auth_state, AuthState::AssumeRoleSuccess);
        assert_eq!(status.identity.as_ref().unwrap().account_id, "111122223333");
        assert_eq!(status.phase(), UpgradePhase::Planning);
        assert_eq!(status.transient_retries, 0);
        assert_eq!(h.connector.roles_used(), vec![Some(ROLE.to_string())]);
    }

    #[tokio::test]
    async fn test_transient_error_backs_off_and_recovers() {
        let h = Harness::new(cluster(), upgrade(NAME, "1.32"));
        h.eks().fail_describe_cluster(Some("Rate exceeded"));
        h.step().await;
        assert_eq!(h.status().phase(), UpgradePhase::Planning);

        assert_eq!(h.step().await, Action::Requeue(Duration::from_secs(5)));
        assert_eq!(h.step().await, Action::Requeue(Duration::from_secs(10)));
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::Planning);
        assert_eq!(status.transient_retries, 2);
        let ready = status.conditions.iter().find(|c| c.r#type == "Ready").unwrap();
        assert_eq!(ready.reason, "TransientError");

        h.eks().fail_describe_cluster(None);
        h.step().await;
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::PreflightChecking);
        assert_eq!(status.transient_retries, 0);
    }

    #[tokio::test]
    async fn test_budget_listing_outage_does_not_fail_preflight() {
        let h = Harness::new(cluster(), upgrade(NAME, "1.32"));
        h.connector.budgets.fail_with_api_error();
        h.run_until(UpgradePhase::PreflightChecking).await;

        for _ in 0..3 {
            assert!(matches!(h.step().await, Action::Requeue(_)));
        }
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::PreflightChecking);
        assert_eq!(status.transient_retries, 3);
        assert!(status.error_message.is_none());

        h.connector.budgets.heal();
        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.transient_retries, 0);
    }

    #[tokio::test]
    async fn test_target_cluster_denying_access_is_auth_failure() {
        let h = Harness::new(cluster(), upgrade(NAME, "1.32"));
        h.connector.budgets.deny_access();
        h.run_until(UpgradePhase::PreflightChecking).await;

        assert!(matches!(h.step().await, Action::Requeue(_)));
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::PreflightChecking);
        assert_eq!(status.auth_state, AuthState::Unverified);
        assert!(status.error_message.is_none());
        let auth = status
            .conditions
            .iter()
            .find(|c| c.r#type == AWS_AUTHENTICATED)
            .unwrap();
        assert_eq!(auth.status, "False");

        h.connector.budgets.heal();
        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.auth_state, AuthState::IdentityVerified);
    }

    #[tokio::test]
    async fn test_new_generation_restarts_finished_run() {
        let h = Harness::new(MockEks::new("1.31"), upgrade(NAME, "1.32"));
        h.run().await;
        let identity_calls = h.identity.identity_calls.load(Ordering::SeqCst);

        h.store.update_spec(NAME, |spec| spec.target_version = "1.33".to_string());
        h.step().await;
        let status = h.status();
        assert_eq!(status.observed_generation, 2);
        assert_eq!(status.phase(), UpgradePhase::Planning);
        assert!(status.step_handles.is_empty());
        // Identity carries over to the new run.
        assert_eq!(status.auth_state, AuthState::IdentityVerified);
        assert_eq!(h.identity.identity_calls.load(Ordering::SeqCst), identity_calls);

        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32", "1.33"]);
    }

    #[tokio::test]
    async fn test_spec_change_during_mutation_is_deferred() {
        let h = Harness::new(MockEks::new("1.31"), upgrade(NAME, "1.32"));
        h.eks().set_polls_to_complete(usize::MAX);
        h.run_until(UpgradePhase::UpgradingControlPlane).await;
        h.step().await;

        h.store.update_spec(NAME, |spec| spec.target_version = "1.33".to_string());
        h.step().await;
        let status = h.status();
        assert_eq!(status.phase(), UpgradePhase::UpgradingControlPlane);
        assert_eq!(status.observed_generation, 1);
        assert_eq!(h.eks().update_calls.load(Ordering::SeqCst), 1);

        h.eks().set_polls_to_complete(0);
        let status = h.run().await;
        assert_eq!(status.phase(), UpgradePhase::Completed);
        assert_eq!(status.observed_generation, 1);
        assert_eq!(h.eks().cluster_update_versions(), vec!["1.32"]);

        // The finished run picks up the pending generation.
        h.step().await;
        let status = h.status();
        assert_eq!(status.observed_generation, 2);
        assert_eq!(status.phase(), UpgradePhase::Planning);
    }

    #[tokio::test]
    async fn test_deleted_resource_is_ignored() {
        let h = Harness::new(MockEks::new("1.31"), upgrade(NAME, "1.32"));
        h.store.delete(NAME);
        assert_eq!(h.step().await, Action::AwaitChange);
        assert_eq!(h.store.writes(), 0);
    }
}
