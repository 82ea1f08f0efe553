//! Multi-device fan-out
//!
//! Every device gets its own task. Each task reports through a pair of
//! single-use channels, one for success and one for failure, and results
//! are collected in request order. A failing or panicking device never
//! affects its siblings.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use cvdr_core::process;
use cvdr_core::registry::remove_socket_file;
use cvdr_core::{
    AgentKind, AggregatedError, ConnectionRecord, CvdrError, DeviceFailure, DeviceLocator,
};
use cvdr_protocol::{ConnectionStatus, ControlState};

use crate::connection::{AgentController, Connector};

/// Result for one device that went through successfully
#[derive(Debug)]
pub struct DeviceSuccess {
    pub status: ConnectionStatus,
    /// Non-fatal problem, e.g. the debug bridge refused to attach
    pub warning: Option<CvdrError>,
}

/// Result of a fan-out operation for one device
#[derive(Debug)]
pub enum DeviceOutcome {
    Succeeded {
        locator: DeviceLocator,
        success: DeviceSuccess,
    },
    Failed(DeviceFailure),
}

impl DeviceOutcome {
    pub fn locator(&self) -> &DeviceLocator {
        match self {
            DeviceOutcome::Succeeded { locator, .. } => locator,
            DeviceOutcome::Failed(failure) => &failure.locator,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeviceOutcome::Succeeded { .. })
    }
}

/// One outcome per requested device, in request order
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub outcomes: Vec<DeviceOutcome>,
}

impl FanOutReport {
    pub fn successes(&self) -> impl Iterator<Item = (&DeviceLocator, &DeviceSuccess)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            DeviceOutcome::Succeeded { locator, success } => Some((locator, success)),
            DeviceOutcome::Failed(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeviceFailure> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            DeviceOutcome::Failed(failure) => Some(failure),
            DeviceOutcome::Succeeded { .. } => None,
        })
    }

    /// Successes, or every failure if at least one device failed
    pub fn into_result(self) -> Result<Vec<(DeviceLocator, DeviceSuccess)>, AggregatedError> {
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for outcome in self.outcomes {
            match outcome {
                DeviceOutcome::Succeeded { locator, success } => successes.push((locator, success)),
                DeviceOutcome::Failed(failure) => failures.push(failure),
            }
        }
        if failures.is_empty() {
            Ok(successes)
        } else {
            Err(AggregatedError { failures })
        }
    }
}

/// Which connections a disconnect applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectTarget {
    /// Named devices of one host
    Devices {
        service_endpoint: String,
        host: String,
        ids: Vec<String>,
    },
    /// Every connection of one host
    Host(String),
    /// Every known connection
    All,
}

/// A spawned per-device task and its result channels
struct Unit<T> {
    locator: DeviceLocator,
    ok: oneshot::Receiver<T>,
    err: oneshot::Receiver<CvdrError>,
}

impl<T: Send + 'static> Unit<T> {
    fn spawn<F>(locator: DeviceLocator, work: F) -> Self
    where
        F: Future<Output = Result<T, CvdrError>> + Send + 'static,
    {
        let (ok_tx, ok) = oneshot::channel();
        let (err_tx, err) = oneshot::channel();
        tokio::spawn(async move {
            match work.await {
                Ok(value) => {
                    let _ = ok_tx.send(value);
                }
                Err(e) => {
                    let _ = err_tx.send(e);
                }
            }
        });
        Self { locator, ok, err }
    }

    /// Wait for whichever channel fires first
    async fn settle(self) -> (DeviceLocator, Result<T, CvdrError>) {
        let Unit {
            locator,
            mut ok,
            mut err,
        } = self;
        let result = tokio::select! {
            Ok(value) = &mut ok => Ok(value),
            Ok(cause) = &mut err => Err(cause),
            else => Err(CvdrError::Internal(format!(
                "task for {} ended without a result",
                locator
            ))),
        };
        (locator, result)
    }
}

enum Pending {
    Running(Unit<DeviceSuccess>),
    Failed(DeviceFailure),
}

/// Connects and disconnects many devices at once
pub struct Fleet {
    connector: Arc<Connector>,
    controllers: Arc<DashMap<DeviceLocator, AgentController>>,
}

impl Fleet {
    pub fn new(connector: Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            controllers: Arc::new(DashMap::new()),
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Number of tunnels hosted in this process
    pub fn in_process_count(&self) -> usize {
        self.controllers.len()
    }

    /// Find or connect every locator concurrently
    ///
    /// `on_success` runs in request order as each device's result becomes
    /// available.
    pub async fn connect_many<F>(
        &self,
        locators: Vec<DeviceLocator>,
        preference: Option<AgentKind>,
        mut on_success: F,
    ) -> FanOutReport
    where
        F: FnMut(&DeviceLocator, &DeviceSuccess),
    {
        tracing::info!("Connecting {} device(s)", locators.len());

        let units: Vec<_> = locators
            .into_iter()
            .map(|locator| {
                let connector = self.connector.clone();
                let target = locator.clone();
                Unit::spawn(locator, async move {
                    connector.find_or_connect(&target, preference).await
                })
            })
            .collect();

        let mut report = FanOutReport::default();
        for unit in units {
            let (locator, result) = unit.settle().await;
            match result {
                Ok(outcome) => {
                    if let Some(controller) = outcome.controller {
                        self.controllers.insert(locator.clone(), controller);
                    }
                    let success = DeviceSuccess {
                        status: outcome.status,
                        warning: outcome.warning,
                    };
                    on_success(&locator, &success);
                    report
                        .outcomes
                        .push(DeviceOutcome::Succeeded { locator, success });
                }
                Err(cause) => {
                    tracing::warn!("Failed to connect {}: {}", locator, cause);
                    report
                        .outcomes
                        .push(DeviceOutcome::Failed(DeviceFailure { locator, cause }));
                }
            }
        }
        report
    }

    /// Stop the tunnels selected by `target` and forget their records
    pub async fn disconnect_many(
        &self,
        target: DisconnectTarget,
    ) -> Result<FanOutReport, CvdrError> {
        let registry = self.connector.registry();

        let resolved: Vec<Result<ConnectionRecord, DeviceFailure>> = match target {
            DisconnectTarget::Devices {
                service_endpoint,
                host,
                ids,
            } => ids
                .into_iter()
                .map(|id| {
                    let locator = DeviceLocator::new(service_endpoint.clone(), host.clone(), id);
                    match registry.get(&locator) {
                        Ok(Some(record)) => Ok(record),
                        Ok(None) => Err(DeviceFailure {
                            cause: CvdrError::NotFound(locator.clone()),
                            locator,
                        }),
                        Err(e) => Err(DeviceFailure {
                            locator,
                            cause: e.into(),
                        }),
                    }
                })
                .collect(),
            DisconnectTarget::Host(host) => {
                let records = registry.list_by_host(&host)?;
                if records.is_empty() {
                    return Err(CvdrError::NoConnections);
                }
                records.into_iter().map(Ok).collect()
            }
            DisconnectTarget::All => {
                let records = registry.list_all()?;
                if records.is_empty() {
                    return Err(CvdrError::NoConnections);
                }
                records.into_iter().map(Ok).collect()
            }
        };

        let pending: Vec<Pending> = resolved
            .into_iter()
            .map(|entry| match entry {
                Ok(record) => {
                    let connector = self.connector.clone();
                    let controllers = self.controllers.clone();
                    Pending::Running(Unit::spawn(
                        record.locator.clone(),
                        stop_connection(connector, controllers, record),
                    ))
                }
                Err(failure) => Pending::Failed(failure),
            })
            .collect();

        let mut report = FanOutReport::default();
        for entry in pending {
            let outcome = match entry {
                Pending::Failed(failure) => DeviceOutcome::Failed(failure),
                Pending::Running(unit) => match unit.settle().await {
                    (locator, Ok(success)) => DeviceOutcome::Succeeded { locator, success },
                    (locator, Err(cause)) => {
                        tracing::warn!("Failed to disconnect {}: {}", locator, cause);
                        DeviceOutcome::Failed(DeviceFailure { locator, cause })
                    }
                },
            };
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    /// Keep in-process tunnels running until they end or `shutdown` fires
    ///
    /// Each tunnel's record is removed once it stops.
    pub async fn wait_in_process(&self, shutdown: CancellationToken) -> FanOutReport {
        let locators: Vec<DeviceLocator> = self
            .controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let waits = locators.into_iter().filter_map(|locator| {
            let (locator, controller) = self.controllers.remove(&locator)?;
            let connector = self.connector.clone();
            let shutdown = shutdown.clone();
            Some(async move {
                let token = controller.token();
                let wait = controller.wait();
                tokio::pin!(wait);
                let result = tokio::select! {
                    result = &mut wait => result,
                    _ = shutdown.cancelled() => {
                        token.cancel();
                        wait.await
                    }
                };
                tracing::info!("In-process tunnel for {} stopped", locator);

                let cleanup = match connector.registry().get(&locator) {
                    Ok(Some(record)) => release(&connector, &record).await,
                    Ok(None) => Ok(None),
                    Err(e) => Err(e.into()),
                };
                let outcome = result.and(cleanup).map(|warning| DeviceSuccess {
                    status: ConnectionStatus {
                        control_port: None,
                        control_state: ControlState::Disconnected,
                    },
                    warning,
                });
                match outcome {
                    Ok(success) => DeviceOutcome::Succeeded { locator, success },
                    Err(cause) => DeviceOutcome::Failed(DeviceFailure { locator, cause }),
                }
            })
        });

        FanOutReport {
            outcomes: futures::future::join_all(waits).await,
        }
    }
}

async fn stop_connection(
    connector: Arc<Connector>,
    controllers: Arc<DashMap<DeviceLocator, AgentController>>,
    record: ConnectionRecord,
) -> Result<DeviceSuccess, CvdrError> {
    if let Some((_, controller)) = controllers.remove(&record.locator) {
        if let Err(e) = controller.stop().await {
            tracing::warn!("Tunnel for {} ended with error: {}", record.locator, e);
        }
    } else if let Some(pid) = record.agent_pid {
        signal_agent(&record.locator, pid)?;
    }

    let warning = release(&connector, &record).await?;
    Ok(DeviceSuccess {
        status: ConnectionStatus {
            control_port: record.status.control_port,
            control_state: ControlState::Disconnected,
        },
        warning,
    })
}

/// Ask a recorded agent process to stop
///
/// Pids that belong to this process or no longer exist are left alone, so a
/// recycled pid is never signalled on behalf of a long-dead agent. Returns
/// whether a signal was sent.
fn signal_agent(locator: &DeviceLocator, pid: u32) -> Result<bool, CvdrError> {
    if pid == std::process::id() {
        tracing::debug!("Record for {} belongs to this process", locator);
        return Ok(false);
    }
    if !process::is_process_alive(pid) {
        tracing::debug!("Agent for {} (pid {}) already exited", locator, pid);
        return Ok(false);
    }
    tracing::info!("Stopping agent for {} (pid {})", locator, pid);
    process::terminate(pid).map_err(|source| CvdrError::AgentStop { pid, source })?;
    Ok(true)
}

/// Detach the debug bridge and forget the record
///
/// A bridge failure is returned as a warning.
async fn release(
    connector: &Connector,
    record: &ConnectionRecord,
) -> Result<Option<CvdrError>, CvdrError> {
    let mut warning = None;
    if let Some(port) = record.status.control_port {
        if let Err(e) = connector.bridge().detach(port).await {
            tracing::warn!("Debug bridge could not detach from port {}: {}", port, e);
            warning = Some(e);
        }
    }
    connector.registry().remove(&record.locator)?;
    remove_socket_file(&record.control_socket)?;
    Ok(warning)
}
