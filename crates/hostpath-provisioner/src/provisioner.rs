//! The entry point that wires identity, driver, election and reconciler
//! together and supervises them until stopped.
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::ClusterApi;
use crate::config::{Config, ConfigError};
use crate::driver::HostPathDriver;
use crate::events::EventRecorder;
use crate::identity::Identity;
use crate::leader::LeaderElector;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::signal::{stop_channel, StopSignal};
use crate::version::KubeVersion;

/// The oldest API server that supports out-of-tree dynamic provisioning.
pub const MINIMUM_SERVER_VERSION: (u32, u32) = (1, 5);

/// Why [`run`] gave up.
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// The configuration was rejected before anything was started.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// An irrecoverable API or filesystem condition.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ProvisionerError {
    /// The process exit code for this error: 1 for configuration errors and 2
    /// for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionerError::Config(_) => 1,
            ProvisionerError::Fatal(_) => 2,
        }
    }
}

/// Runs the provisioner until `stop` fires.
///
/// The reconciler only runs while this replica holds the leader lease. When
/// stopped, the reconciler is shut down first and the lease released after,
/// so that a successor never overlaps with this replica's work.
pub async fn run(
    config: Config,
    api: Arc<dyn ClusterApi>,
    stop: StopSignal,
) -> Result<(), ProvisionerError> {
    config.validate()?;

    let identity = Identity::generate().context("unable to generate provisioner identity")?;

    let version = api
        .server_version()
        .await
        .context("unable to read API server version")?;
    let version = version
        .parse::<KubeVersion>()
        .context("unable to parse API server version")?;
    let (major, minor) = MINIMUM_SERVER_VERSION;
    if !version.at_least(major, minor) {
        return Err(anyhow::anyhow!(
            "API server {} does not support out-of-tree dynamic provisioning, {}.{} or later is required",
            version,
            major,
            minor
        )
        .into());
    }

    let driver = HostPathDriver::new(&config.root_dir).context("unable to use root directory")?;
    driver
        .ensure_root()
        .await
        .context("unable to prepare root directory")?;

    let hostname = match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(hostname)) => hostname,
        _ => {
            warn!("Unable to read hostname, leaving it out of the event source");
            String::from("unknown")
        }
    };
    let component = format!("{} {} {}", config.provisioner_name, hostname, identity);
    let (events, events_task) = EventRecorder::start(api.clone(), component, config.event_buffer);

    info!(
        identity = %identity,
        provisioner = %config.provisioner_name,
        root = %config.root_dir.display(),
        server = %version,
        "Starting provisioner"
    );

    let settings = ReconcilerSettings {
        provisioner_name: config.provisioner_name.clone(),
        identity: identity.clone(),
        server_version: version,
        worker_count: config.worker_count,
        max_retries: config.max_retries,
        intent_deadline: config.retry_period.saturating_mul(10),
    };
    let (leading_tx, mut leading) = watch::channel(false);
    let (elector_trigger, elector_stop) = stop_channel();
    let elector = LeaderElector::new(api.clone(), identity, config.election());
    let elector_task = tokio::spawn(elector.run(leading_tx, elector_stop));

    let mut supervisor = Supervisor::new(api, driver, events, settings);
    let mut elector_died = false;
    loop {
        tokio::select! {
            changed = leading.changed() => {
                if changed.is_err() {
                    elector_died = true;
                    break;
                }
                let is_leader = *leading.borrow();
                supervisor.leadership_changed(is_leader).await;
            }
            _ = stop.stopped() => break,
        }
    }

    // The event task drains whatever is queued once the last recorder,
    // held by the supervisor, is gone
    supervisor.stop().await;
    elector_trigger.stop();
    if let Err(e) = elector_task.await {
        error!(error = %e, "Leader election task failed");
        elector_died = true;
    }

    if tokio::time::timeout(config.retry_period, events_task)
        .await
        .is_err()
    {
        warn!("Gave up waiting for pending events to be delivered");
    }

    if elector_died && !stop.is_stopped() {
        return Err(anyhow::anyhow!("leader election stopped unexpectedly").into());
    }
    info!("Provisioner stopped");
    Ok(())
}

/// Keeps a reconciler running for exactly the terms this replica leads.
struct Supervisor {
    api: Arc<dyn ClusterApi>,
    driver: HostPathDriver,
    events: EventRecorder,
    settings: ReconcilerSettings,
    running: Option<Reconciler>,
}

impl Supervisor {
    fn new(
        api: Arc<dyn ClusterApi>,
        driver: HostPathDriver,
        events: EventRecorder,
        settings: ReconcilerSettings,
    ) -> Self {
        Supervisor {
            api,
            driver,
            events,
            settings,
            running: None,
        }
    }

    /// The elector only publishes transitions, but the watch channel keeps
    /// just the latest one. Seeing `true` while a reconciler runs means a
    /// term was lost and regained in between, so the old reconciler is
    /// replaced rather than kept.
    async fn leadership_changed(&mut self, is_leader: bool) {
        if let Some(running) = self.running.take() {
            if is_leader {
                warn!("Leadership was lost and regained, restarting reconciler");
            } else {
                info!("Lost leadership, stopping reconciler");
            }
            running.stop().await;
        }
        if is_leader {
            info!("Became leader, starting reconciler");
            self.running = Some(Reconciler::start(
                self.api.clone(),
                self.driver.clone(),
                self.events.clone(),
                self.settings.clone(),
            ));
        }
    }

    async fn stop(mut self) {
        if let Some(running) = self.running.take() {
            running.stop().await;
        }
    }
}

#[cfg(all(test, unix))]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::api::memory::{MemoryApi, Op};
    use crate::identity::IDENTITY_ANNOTATION;
    use crate::reconciler::test::{class, claim, eventually, settings, PROVISIONER};

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default_config(root, PROVISIONER);
        config.lease_duration = Duration::from_millis(1500);
        config.renew_deadline = Duration::from_millis(1000);
        config.retry_period = Duration::from_millis(200);
        config
    }

    fn stamp(api: &MemoryApi, volume: &str) -> Option<String> {
        api.volume(volume)
            .and_then(|v| v.metadata.annotations)
            .and_then(|a| a.get(IDENTITY_ANNOTATION).cloned())
    }

    #[tokio::test]
    async fn invalid_config_exits_with_one() {
        let api = MemoryApi::new();
        let (_trigger, stop) = stop_channel();
        let config = Config::default_config("relative", PROVISIONER);
        let err = run(config, Arc::new(api), stop).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn old_servers_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let api = MemoryApi::new();
        api.set_version("v1.4.0");
        let (_trigger, stop) = stop_channel();
        let err = run(config(root.path()), Arc::new(api.clone()), stop)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("v1.4.0"), "{}", err);
        assert!(api.leader_record().is_none());
    }

    #[tokio::test]
    async fn unparseable_server_version_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let api = MemoryApi::new();
        api.set_version("latest");
        let (_trigger, stop) = stop_channel();
        let err = run(config(root.path()), Arc::new(api), stop)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn regained_leadership_restarts_the_reconciler() {
        let root = tempfile::tempdir().unwrap();
        let api = MemoryApi::new();
        let (events, _) = EventRecorder::start(Arc::new(api.clone()), "test", 8);
        let mut supervisor = Supervisor::new(
            Arc::new(api.clone()),
            HostPathDriver::new(root.path()).unwrap(),
            events,
            settings("me"),
        );

        supervisor.leadership_changed(true).await;
        eventually("first watch", || api.calls(Op::WatchClaims) == 1).await;

        // The step down in between was overwritten before it was seen
        supervisor.leadership_changed(true).await;
        eventually("second watch", || api.calls(Op::WatchClaims) == 2).await;
        assert!(supervisor.running.is_some());

        supervisor.leadership_changed(false).await;
        assert!(supervisor.running.is_none());
        supervisor.leadership_changed(false).await;
        assert!(supervisor.running.is_none());
        assert_eq!(api.calls(Op::WatchClaims), 2);
    }

    #[tokio::test]
    async fn leader_provisions_and_releases_on_stop() {
        let root = tempfile::tempdir().unwrap();
        let api = MemoryApi::new();
        api.add_class(class("c", PROVISIONER, "Delete"));
        let (trigger, stop) = stop_channel();
        let task = tokio::spawn(run(config(root.path()), Arc::new(api.clone()), stop));

        api.apply_claim(claim("ns1", "c1", "u1", "c"));
        eventually("volume pvc-u1", || api.volume("pvc-u1").is_some()).await;
        let holder = api.leader_record().unwrap().holder_identity;
        assert_eq!(stamp(&api, "pvc-u1").as_deref(), Some(holder.as_str()));
        assert!(root.path().join("ns1").join("c1").is_dir());

        trigger.stop();
        task.await.unwrap().unwrap();
        assert!(api.leader_record().unwrap().is_vacant());
    }

    #[tokio::test]
    async fn leadership_hands_over_to_the_standby() {
        let root = tempfile::tempdir().unwrap();
        let api_a = MemoryApi::new();
        let api_b = api_a.replica();
        api_a.add_class(class("c", PROVISIONER, "Delete"));

        let (trigger_a, stop_a) = stop_channel();
        let task_a = tokio::spawn(run(config(root.path()), Arc::new(api_a.clone()), stop_a));
        api_a.apply_claim(claim("ns1", "c1", "u1", "c"));
        eventually("volume pvc-u1", || api_a.volume("pvc-u1").is_some()).await;
        let a = stamp(&api_a, "pvc-u1").unwrap();

        let (trigger_b, stop_b) = stop_channel();
        let task_b = tokio::spawn(run(config(root.path()), Arc::new(api_b.clone()), stop_b));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api_b.leader_record().unwrap().holder_identity, a);

        // A can no longer reach the API server
        api_a.set_partitioned(true);
        eventually("B to take over", || {
            api_b
                .leader_record()
                .map_or(false, |r| !r.is_vacant() && r.holder_identity != a)
        })
        .await;
        let b = api_b.leader_record().unwrap().holder_identity;

        api_b.apply_claim(claim("ns1", "c2", "u2", "c"));
        eventually("volume pvc-u2", || api_b.volume("pvc-u2").is_some()).await;
        assert_eq!(stamp(&api_b, "pvc-u2"), Some(b));
        assert_eq!(stamp(&api_b, "pvc-u1"), Some(a));

        trigger_a.stop();
        trigger_b.stop();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
    }
}
