//! Local debug bridge clients

use async_trait::async_trait;
use tokio::process::Command;

use cvdr_core::traits::DebugBridge;
use cvdr_core::CvdrError;

/// Attaches tunnels to the local adb server
#[derive(Debug, Clone)]
pub struct AdbBridge {
    program: String,
}

impl AdbBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, action: &str, port: u16) -> Result<(), CvdrError> {
        let serial = format!("127.0.0.1:{}", port);
        let output = Command::new(&self.program)
            .arg(action)
            .arg(&serial)
            .output()
            .await
            .map_err(|e| CvdrError::Bridge(format!("failed to run {}: {}", self.program, e)))?;

        // adb reports some failures with a zero exit status
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || stdout.contains("failed to") || stdout.contains("error:") {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(CvdrError::Bridge(format!(
                "{} {} {}: {}",
                self.program, action, serial, detail
            )));
        }

        tracing::debug!("{} {} {}: {}", self.program, action, serial, stdout.trim());
        Ok(())
    }
}

#[async_trait]
impl DebugBridge for AdbBridge {
    async fn attach(&self, port: u16) -> Result<(), CvdrError> {
        self.run("connect", port).await
    }

    async fn detach(&self, port: u16) -> Result<(), CvdrError> {
        self.run("disconnect", port).await
    }
}

/// Leaves the debug bridge alone (`--no-adb`)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBridge;

#[async_trait]
impl DebugBridge for NoopBridge {
    async fn attach(&self, _port: u16) -> Result<(), CvdrError> {
        Ok(())
    }

    async fn detach(&self, _port: u16) -> Result<(), CvdrError> {
        Ok(())
    }
}
