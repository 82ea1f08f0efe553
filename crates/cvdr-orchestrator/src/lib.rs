//! cvdr-orchestrator: Connection protocol and multi-device fan-out
//!
//! [`Connector`] finds an existing live tunnel for a device or launches a new
//! agent for it. [`Fleet`] runs that protocol for many devices at once and
//! tears tunnels down again, keeping every device's outcome independent.

pub mod connection;
pub mod fleet;

pub use connection::{
    AgentController, AgentLauncher, ConnectOutcome, ConnectSettings, Connector,
    InProcessLauncher, LaunchRequest, LaunchedAgent, SubprocessLauncher,
};
pub use fleet::{DeviceOutcome, DeviceSuccess, DisconnectTarget, FanOutReport, Fleet};
