//! Output formatting utilities for the CLI

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};

use cvdr_core::ConnectionRecord;
use cvdr_protocol::ControlState;

/// Format connection records as an ASCII table
///
/// Connected records show the adb serial of their local endpoint.
pub fn format_connections(records: &[ConnectionRecord]) -> String {
    if records.is_empty() {
        return "No connections".to_string();
    }

    #[derive(Tabled)]
    struct ConnectionRow {
        #[tabled(rename = "HOST")]
        host: String,
        #[tabled(rename = "DEVICE")]
        device: String,
        #[tabled(rename = "AGENT")]
        agent: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "LOG")]
        log: String,
    }

    let rows: Vec<ConnectionRow> = records
        .iter()
        .map(|r| ConnectionRow {
            host: r.locator.host.clone(),
            device: r.locator.device_id.clone(),
            agent: r.agent_kind.to_string(),
            status: match (r.status.control_state, r.status.control_port) {
                (ControlState::Connected, Some(port)) => format!("ADB: 127.0.0.1:{}", port),
                (state, _) => state.to_string(),
            },
            pid: r
                .agent_pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            log: r.log_file.display().to_string(),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

fn print_marked(stderr: bool, color: Color, mark: &str, msg: &str) {
    if stderr {
        let _ = crossterm::execute!(
            std::io::stderr(),
            SetForegroundColor(color),
            Print(mark),
            ResetColor,
            Print(msg),
            Print("\n")
        );
    } else {
        let _ = crossterm::execute!(
            std::io::stdout(),
            SetForegroundColor(color),
            Print(mark),
            ResetColor,
            Print(msg),
            Print("\n")
        );
    }
}

/// Print a success message in green to stdout
pub fn print_success(msg: &str) {
    print_marked(false, Color::Green, "✓ ", msg);
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    print_marked(true, Color::Red, "✗ ", msg);
}

/// Print a warning in yellow to stderr
pub fn print_warning(msg: &str) {
    print_marked(true, Color::Yellow, "⚠ ", msg);
}

/// Print an informational message in cyan to stdout
pub fn print_info(msg: &str) {
    print_marked(false, Color::Cyan, "ℹ ", msg);
}
