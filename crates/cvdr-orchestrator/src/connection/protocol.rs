//! Find-or-connect
//!
//! A device has at most one live tunnel. Asking for a device that already
//! has a connected record with a running agent returns that record's status
//! instead of starting another agent. Calls for the same device within one
//! process run one at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use cvdr_core::config::CvdrConfig;
use cvdr_core::process;
use cvdr_core::registry::remove_socket_file;
use cvdr_core::time::unix_now_secs;
use cvdr_core::traits::{DebugBridge, DeviceDirectory};
use cvdr_core::{
    AgentKind, ConfigError, ConnectionRecord, CvdrError, DeviceLocator, ProxyAddress, Registry,
};
use cvdr_protocol::ConnectionStatus;

use super::launcher::{AgentController, AgentLauncher, LaunchRequest};

/// Transport settings shared by every connection attempt
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub proxy: Option<ProxyAddress>,
    pub ice_config: Option<PathBuf>,
    pub base_control_port: u16,
    pub log_files_delete_threshold: Duration,
}

impl ConnectSettings {
    pub fn from_config(config: &CvdrConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            proxy: config.proxy_address()?,
            ice_config: config.ice_config.clone(),
            base_control_port: config.base_control_port,
            log_files_delete_threshold: config.log_files_delete_threshold,
        })
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        let config = CvdrConfig::default();
        Self {
            proxy: None,
            ice_config: None,
            base_control_port: config.base_control_port,
            log_files_delete_threshold: config.log_files_delete_threshold,
        }
    }
}

/// Result of a find-or-connect call
#[derive(Debug)]
pub struct ConnectOutcome {
    pub status: ConnectionStatus,
    /// Set only when a new agent was started in this process
    pub controller: Option<AgentController>,
    /// Non-fatal problem, e.g. the debug bridge could not attach
    pub warning: Option<CvdrError>,
}

/// Finds or creates the tunnel for a device
pub struct Connector {
    registry: Registry,
    directory: Arc<dyn DeviceDirectory>,
    bridge: Arc<dyn DebugBridge>,
    launcher: Arc<dyn AgentLauncher>,
    settings: ConnectSettings,
    gates: DashMap<DeviceLocator, Arc<Mutex<()>>>,
}

impl Connector {
    pub fn new(
        registry: Registry,
        directory: Arc<dyn DeviceDirectory>,
        bridge: Arc<dyn DebugBridge>,
        launcher: Arc<dyn AgentLauncher>,
        settings: ConnectSettings,
    ) -> Self {
        Self {
            registry,
            directory,
            bridge,
            launcher,
            settings,
            gates: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<dyn DebugBridge> {
        &self.bridge
    }

    /// Return the device's live tunnel, starting one if there is none
    pub async fn find_or_connect(
        &self,
        locator: &DeviceLocator,
        preference: Option<AgentKind>,
    ) -> Result<ConnectOutcome, CvdrError> {
        locator.validate()?;

        let gate = self.gates.entry(locator.clone()).or_default().clone();
        let _held = gate.lock().await;

        if let Some(record) = self.registry.get(locator)? {
            if is_live(&record) {
                tracing::info!("Reusing existing connection for {}", locator);
                let warning = self.attach_bridge(&record.status).await;
                return Ok(ConnectOutcome {
                    status: record.status,
                    controller: None,
                    warning,
                });
            }

            tracing::info!(
                "Discarding stale connection record for {} ({}, pid {:?})",
                locator,
                record.status.control_state,
                record.agent_pid
            );
            if let Err(e) = remove_socket_file(&record.control_socket) {
                tracing::warn!("{}", e);
            }
            self.registry.remove(locator)?;
        }

        let kind = match preference {
            Some(kind) => kind,
            None => self.directory.resolve(locator).await?.preferred_agent(),
        };
        let target = match kind {
            AgentKind::Proxy => Some(self.directory.debug_endpoint(locator).await?),
            AgentKind::Signaling => None,
        };

        let mut record = ConnectionRecord {
            locator: locator.clone(),
            status: ConnectionStatus::connecting(),
            agent_pid: None,
            agent_kind: kind,
            log_file: self.registry.new_log_path(locator),
            control_socket: self.registry.socket_path(locator),
            created_at: unix_now_secs(),
        };
        self.registry.put(&record)?;

        self.spawn_log_pruning();

        let request = LaunchRequest {
            locator: locator.clone(),
            kind,
            socket_path: record.control_socket.clone(),
            log_file: record.log_file.clone(),
            base_control_port: self.settings.base_control_port,
            proxy: self.settings.proxy.clone(),
            ice_config: self.settings.ice_config.clone(),
            target,
        };

        tracing::info!("Launching {} agent for {}", kind, locator);
        let launched = match self.launcher.launch(request).await {
            Ok(launched) => launched,
            Err(e) => {
                if let Err(remove_err) = self.registry.remove(locator) {
                    tracing::warn!("Failed to clean up record for {}: {}", locator, remove_err);
                }
                return Err(e);
            }
        };

        record.status = launched.status;
        record.agent_pid = launched.pid;
        self.registry.put(&record)?;
        tracing::info!("Connected {} at {}", locator, record.status);

        let warning = self.attach_bridge(&record.status).await;
        Ok(ConnectOutcome {
            status: record.status,
            controller: launched.controller,
            warning,
        })
    }

    async fn attach_bridge(&self, status: &ConnectionStatus) -> Option<CvdrError> {
        let port = status.control_port?;
        match self.bridge.attach(port).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Debug bridge could not attach to port {}: {}", port, e);
                Some(e)
            }
        }
    }

    fn spawn_log_pruning(&self) {
        let registry = self.registry.clone();
        let max_age = self.settings.log_files_delete_threshold;
        tokio::task::spawn_blocking(move || match registry.prune_stale_logs(max_age) {
            Ok(0) => {}
            Ok(count) => tracing::info!("Deleted {} old agent log files", count),
            Err(e) => tracing::warn!("Failed to delete old agent logs: {}", e),
        });
    }
}

fn is_live(record: &ConnectionRecord) -> bool {
    record.status.is_connected() && record.agent_pid.is_some_and(process::is_process_alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::sleep;

    use crate::connection::launcher::LaunchedAgent;
    use cvdr_core::Reachability;

    struct DirectDirectory;

    #[async_trait]
    impl DeviceDirectory for DirectDirectory {
        async fn resolve(&self, _: &DeviceLocator) -> Result<Reachability, CvdrError> {
            Ok(Reachability::Direct {
                address: "10.0.0.4".into(),
            })
        }

        async fn debug_endpoint(&self, _: &DeviceLocator) -> Result<String, CvdrError> {
            Ok("10.0.0.4:6520".into())
        }
    }

    #[derive(Default)]
    struct RecordingBridge {
        attached: Mutex<Vec<u16>>,
        fail: bool,
    }

    #[async_trait]
    impl DebugBridge for RecordingBridge {
        async fn attach(&self, port: u16) -> Result<(), CvdrError> {
            if self.fail {
                return Err(CvdrError::Bridge("adb not found".into()));
            }
            self.attached.lock().unwrap().push(port);
            Ok(())
        }

        async fn detach(&self, _: u16) -> Result<(), CvdrError> {
            Ok(())
        }
    }

    /// Pretends to start an agent in this process on a fixed port
    #[derive(Default)]
    struct FakeLauncher {
        launches: AtomicUsize,
        requests: Mutex<Vec<LaunchRequest>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl AgentLauncher for FakeLauncher {
        async fn launch(&self, request: LaunchRequest) -> Result<LaunchedAgent, CvdrError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            let locator = request.locator.clone();
            self.requests.lock().unwrap().push(request);
            if self.fail {
                return Err(CvdrError::AgentUnresponsive {
                    locator,
                    exit: Some(1),
                });
            }
            Ok(LaunchedAgent {
                status: ConnectionStatus::connected(5555),
                pid: Some(std::process::id()),
                controller: None,
            })
        }
    }

    fn connector(
        dir: &TempDir,
        launcher: Arc<FakeLauncher>,
        bridge: Arc<RecordingBridge>,
    ) -> Connector {
        Connector::new(
            Registry::open(dir.path()).unwrap(),
            Arc::new(DirectDirectory),
            bridge,
            launcher,
            ConnectSettings::default(),
        )
    }

    fn locator() -> DeviceLocator {
        DeviceLocator::new("http://svc", "host-1", "dev-7")
    }

    #[tokio::test]
    async fn test_second_call_reuses_connection() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = Arc::new(RecordingBridge::default());
        let connector = connector(&dir, launcher.clone(), bridge.clone());

        let first = connector.find_or_connect(&locator(), None).await.unwrap();
        let second = connector.find_or_connect(&locator(), None).await.unwrap();

        assert_eq!(first.status, ConnectionStatus::connected(5555));
        assert_eq!(first.status, second.status);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        // The bridge is asked to attach both times
        assert_eq!(*bridge.attached.lock().unwrap(), vec![5555, 5555]);
    }

    #[tokio::test]
    async fn test_concurrent_calls_launch_once() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let connector = connector(&dir, launcher.clone(), Arc::default());

        let locator = locator();
        let (first, second) = tokio::join!(
            connector.find_or_connect(&locator, None),
            connector.find_or_connect(&locator, None),
        );

        assert_eq!(first.unwrap().status, second.unwrap().status);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_direct_host_uses_proxy_agent() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let connector = connector(&dir, launcher.clone(), Arc::default());

        connector.find_or_connect(&locator(), None).await.unwrap();

        let requests = launcher.requests.lock().unwrap();
        assert_eq!(requests[0].kind, AgentKind::Proxy);
        assert_eq!(requests[0].target.as_deref(), Some("10.0.0.4:6520"));
    }

    #[tokio::test]
    async fn test_preference_overrides_reachability() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let connector = connector(&dir, launcher.clone(), Arc::default());

        connector
            .find_or_connect(&locator(), Some(AgentKind::Signaling))
            .await
            .unwrap();

        let requests = launcher.requests.lock().unwrap();
        assert_eq!(requests[0].kind, AgentKind::Signaling);
        assert!(requests[0].target.is_none());
    }

    #[tokio::test]
    async fn test_stale_record_is_replaced() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let connector = connector(&dir, launcher.clone(), Arc::default());

        let registry = connector.registry().clone();
        registry
            .put(&ConnectionRecord {
                locator: locator(),
                status: ConnectionStatus::connected(6000),
                agent_pid: Some(999_999_999),
                agent_kind: AgentKind::Proxy,
                log_file: registry.new_log_path(&locator()),
                control_socket: registry.socket_path(&locator()),
                created_at: 0,
            })
            .unwrap();

        let outcome = connector.find_or_connect(&locator(), None).await.unwrap();
        assert_eq!(outcome.status.control_port, Some(5555));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_no_record() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher {
            fail: true,
            ..Default::default()
        });
        let connector = connector(&dir, launcher, Arc::default());

        let err = connector.find_or_connect(&locator(), None).await.unwrap_err();
        assert!(matches!(err, CvdrError::AgentUnresponsive { .. }));
        assert!(connector.registry().get(&locator()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bridge_failure_is_warning() {
        let dir = TempDir::new().unwrap();
        let bridge = Arc::new(RecordingBridge {
            fail: true,
            ..Default::default()
        });
        let connector = connector(&dir, Arc::default(), bridge);

        let outcome = connector.find_or_connect(&locator(), None).await.unwrap();
        assert!(outcome.status.is_connected());
        assert!(matches!(outcome.warning, Some(CvdrError::Bridge(_))));

        let stored = connector.registry().get(&locator()).unwrap().unwrap();
        assert_eq!(stored.agent_pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_invalid_locator_rejected() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let connector = connector(&dir, launcher.clone(), Arc::default());

        let err = connector
            .find_or_connect(&DeviceLocator::new("http://svc", "", "dev-7"), None)
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }
}
