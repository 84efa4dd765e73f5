//! Configuration capture over an open session.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::error::{BackupError, ErrorKind, Result};
use crate::session::DeviceSession;

/// Sanitized configuration text plus capture metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePayload {
    pub text: String,
    /// Bytes received from the capture commands before sanitization.
    pub raw_size: usize,
    pub duration: Duration,
    /// Values of the driver's info commands (version, hostname).
    pub info: BTreeMap<String, String>,
    /// Sectioned output of the driver's additional show commands.
    #[serde(default)]
    pub additional: Option<String>,
}

/// Runs a driver's command tables on a session.
#[derive(Debug, Clone)]
pub struct CaptureEngine {
    command_timeout: Duration,
}

impl CaptureEngine {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Escalates if requested, prepares the terminal, captures and sanitizes.
    ///
    /// Setup commands that the device rejects or that time out are logged
    /// and skipped. A rejected capture command fails the capture.
    pub async fn capture(
        &self,
        session: &mut dyn DeviceSession,
        driver: &Driver,
        escalation: Option<&str>,
    ) -> Result<CapturePayload> {
        let started = Instant::now();
        let vendor = driver.vendor();

        if let Some(command) = escalation {
            debug!("{vendor}: escalating with '{command}'");
            session.escalate(command, self.command_timeout).await?;
        }

        for command in driver.setup_commands() {
            match session.execute(command, self.command_timeout).await {
                Ok(output) if !output.success => warn!(
                    "{vendor}: setup command '{command}' rejected: {}",
                    output.error_line.unwrap_or_default()
                ),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::CommandTimeout => {
                    warn!("{vendor}: setup command '{command}' timed out")
                }
                Err(e) => return Err(e),
            }
        }

        let mut sections = Vec::with_capacity(driver.capture_commands().len());
        for command in driver.capture_commands() {
            let output = session.execute(command, self.command_timeout).await?;
            driver.classify_output(command, &output)?;
            sections.push(output.content);
        }
        let raw = sections.join("\n");

        let mut info = BTreeMap::new();
        for (name, command) in driver.info_commands() {
            match session.execute(command, self.command_timeout).await {
                Ok(output) if output.success => {
                    if let Some(value) = output.content.lines().map(str::trim).find(|l| !l.is_empty()) {
                        info.insert(name.clone(), value.to_string());
                    }
                }
                Ok(_) => debug!("{vendor}: info command '{command}' rejected"),
                Err(e) if e.kind() == ErrorKind::CommandTimeout => {
                    warn!("{vendor}: info command '{command}' timed out")
                }
                Err(e) => return Err(e),
            }
        }

        let text = driver.sanitize(&raw);
        if text.is_empty() {
            return Err(BackupError::ProtocolError(format!(
                "{vendor}: capture returned no configuration"
            )));
        }

        let additional = if driver.additional_commands().is_empty() {
            None
        } else {
            Some(self.additional(session, driver).await)
        };

        Ok(CapturePayload {
            raw_size: raw.len(),
            text,
            duration: started.elapsed(),
            info,
            additional,
        })
    }

    /// Runs the additional show commands, one `===== cmd =====` section
    /// each. A failing command is written into its section as an `ERROR:`
    /// line and never fails the capture.
    async fn additional(&self, session: &mut dyn DeviceSession, driver: &Driver) -> String {
        let vendor = driver.vendor();
        let mut sections = Vec::with_capacity(driver.additional_commands().len() * 3);
        for command in driver.additional_commands() {
            sections.push(format!("===== {command} ====="));
            match session.execute(command, self.command_timeout).await {
                Ok(output) if output.success => sections.push(output.content),
                Ok(output) => {
                    let line = output.error_line.unwrap_or_else(|| "command rejected".to_string());
                    warn!("{vendor}: additional command '{command}' rejected: {line}");
                    sections.push(format!("ERROR: {line}"));
                }
                Err(e) => {
                    warn!("{vendor}: additional command '{command}' failed: {e}");
                    sections.push(format!("ERROR: {}", e.detail()));
                }
            }
            sections.push(String::new());
        }
        driver.sanitize(&sections.join("\n"))
    }
}
