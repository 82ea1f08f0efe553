//! Find-or-connect protocol for a single device

mod launcher;
mod protocol;

pub use launcher::{
    AgentController, AgentLauncher, InProcessLauncher, LaunchRequest, LaunchedAgent,
    SubprocessLauncher,
};
pub use protocol::{ConnectOutcome, ConnectSettings, Connector};
