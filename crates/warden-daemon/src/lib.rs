//! Warden daemon wiring
//!
//! Builds the platform integration, the connection tracker, the
//! inspection framework and the firewall, connects their channels and
//! runs the workers. Collaborators (policy engine, tunnel client,
//! resolver, process attribution) are injected; the `defaults` module
//! provides permissive stand-ins so the core runs before the rest of the
//! application is wired up.

#![warn(clippy::all)]

pub mod defaults;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use warden_common::{CoreConfig, Error, Result};
use warden_conntrack::{BandwidthSample, ConnectionTracker};
use warden_firewall::interop::{
    NetworkEnvironment, PolicyDecider, ResolverInfo, SelfcheckSink, VerdictPersistencePolicy,
};
use warden_firewall::{dispatch, Collaborators as PipelineCollaborators, Firewall};
use warden_inspect::encryption;
use warden_inspect::http::{HostPolicy, HttpInspector};
use warden_inspect::portscan::PortscanDetector;
use warden_inspect::tls::{CertificateVerifier, TlsInspector, WebPkiVerifier};
use warden_inspect::{InspectionFramework, InspectorFactory};
use warden_kernel::{NoopIntegration, OsIntegration, ProcessAttributor};

/// Everything the core consumes from the rest of the application
pub struct Collaborators {
    pub policy: Arc<dyn PolicyDecider>,
    pub tunnel: Arc<dyn warden_firewall::interop::TunnelManager>,
    pub resolver: Arc<dyn ResolverInfo>,
    pub netenv: Arc<dyn NetworkEnvironment>,
    pub selfcheck: Arc<dyn SelfcheckSink>,
    pub persistence: Arc<dyn VerdictPersistencePolicy>,
    pub attributor: Arc<dyn ProcessAttributor>,
    pub host_policy: Arc<dyn HostPolicy>,
    pub cert_verifier: Option<Arc<dyn CertificateVerifier>>,
}

/// The assembled interception core
pub struct Warden {
    config: CoreConfig,
    firewall: Arc<Firewall>,
    integration: Arc<dyn OsIntegration>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    bandwidth_rx: Mutex<Option<mpsc::Receiver<BandwidthSample>>>,
}

impl Warden {
    /// Assemble with explicit collaborators and integration
    pub fn new(
        config: CoreConfig,
        collaborators: Collaborators,
        integration: Arc<dyn OsIntegration>,
    ) -> Result<Self> {
        let tracker = Arc::new(ConnectionTracker::new());

        let cert_verifier = match collaborators.cert_verifier {
            Some(verifier) => verifier,
            None => Arc::new(
                WebPkiVerifier::new().map_err(Error::PolicyError)?,
            ),
        };
        let factories: Vec<InspectorFactory> = vec![
            encryption::factory(),
            TlsInspector::factory(cert_verifier),
            HttpInspector::factory(collaborators.host_policy.clone()),
        ];
        let inspection = Arc::new(InspectionFramework::new(
            factories,
            config.limits.reassembly_cap,
        ));

        let fasttrack = warden_firewall::FastTracker::new(
            config.clone(),
            collaborators.netenv.clone(),
            collaborators.resolver.clone(),
            collaborators.selfcheck.clone(),
        );

        let firewall = Arc::new(Firewall::new(
            config.clone(),
            tracker,
            fasttrack,
            inspection,
            Arc::new(PortscanDetector::new(config.portscan)),
            PipelineCollaborators {
                policy: collaborators.policy,
                tunnel: collaborators.tunnel,
                resolver: collaborators.resolver,
                persistence: collaborators.persistence,
            },
            Arc::new(warden_common::metrics::PacketCounters::default()),
            Arc::new(warden_firewall::OwnPortRegistry::new()),
            std::process::id(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            firewall,
            integration,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            bandwidth_rx: Mutex::new(None),
        })
    }

    /// Assemble with the platform integration and default collaborators
    pub fn with_defaults(config: CoreConfig) -> Result<Self> {
        let collaborators = defaults::collaborators(&config);
        let integration = platform_integration(&config, collaborators.attributor.clone());
        Self::new(config, collaborators, integration)
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn integration(&self) -> &Arc<dyn OsIntegration> {
        &self.integration
    }

    /// External bandwidth stream (per-connection samples after they were
    /// applied to the connection records); take it before `start`
    pub fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>> {
        self.bandwidth_rx.lock().take()
    }

    /// Start the integration and all workers. Integration start errors
    /// are fatal to the subsystem and propagate.
    pub async fn start(&self) -> Result<()> {
        // kernel-reported terminations remove the connection right away
        let firewall = self.firewall.clone();
        self.integration
            .set_connection_end_handler(Box::new(move |fingerprint| {
                if let Some(conn) = firewall.tracker().delete(&fingerprint) {
                    firewall.teardown_connection(&conn);
                }
            }));

        self.integration.start().await?;
        tracing::info!(
            integration = %self.integration.version(),
            "interception core started"
        );

        let mut tasks = self.tasks.lock();

        if let Some(packets) = self.integration.take_packet_stream() {
            tasks.push(tokio::spawn(dispatch::run_dispatcher(
                self.firewall.clone(),
                packets,
                self.shutdown.subscribe(),
            )));
        }

        if let Some(samples) = self.integration.take_bandwidth_stream() {
            let (sink_tx, sink_rx) = mpsc::channel(1024);
            *self.bandwidth_rx.lock() = Some(sink_rx);
            tasks.push(tokio::spawn(warden_firewall::bandwidth::run_bandwidth_accounting(
                self.firewall.tracker().clone(),
                samples,
                sink_tx,
                self.shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(dispatch::run_stats_worker(
            self.firewall.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(dispatch::run_maintenance(
            self.firewall.clone(),
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    /// Re-evaluate all connections (configuration-change, profile-change
    /// or tunnel-connect events)
    pub async fn reevaluate(&self) -> Result<()> {
        self.firewall.reevaluate_all(self.integration.as_ref()).await
    }

    /// Stop the workers, drain best-effort, remove kernel state
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.integration.stop().await?;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        tracing::info!("interception core stopped");
        Ok(())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

/// Pick the integration for this platform and configuration
pub fn platform_integration(
    config: &CoreConfig,
    attributor: Arc<dyn ProcessAttributor>,
) -> Arc<dyn OsIntegration> {
    if config.disable_interception {
        tracing::warn!("interception disabled, all packet paths are no-ops");
        return Arc::new(NoopIntegration::new());
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(warden_kernel::nfqueue::NfqueueIntegration::new(
            config.clone(),
            attributor,
        ))
    }
    #[cfg(target_os = "windows")]
    {
        let _ = attributor; // the kext attributes processes in-kernel
        match warden_kernel::kext::device::WindowsKextDevice::open() {
            Ok(device) => Arc::new(warden_kernel::kext::KextIntegration::new(
                config.clone(),
                Arc::new(device),
            )),
            Err(e) => {
                tracing::error!(error = %e, "kernel extension unavailable");
                Arc::new(NoopIntegration::new())
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        let _ = attributor;
        tracing::warn!("no integration for this platform, observation only");
        Arc::new(NoopIntegration::new())
    }
}
