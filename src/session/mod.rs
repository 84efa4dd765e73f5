//! Device sessions over SSH and Telnet.
//!
//! A session is opened for exactly one attempt on one device and closed when
//! the attempt ends; nothing is pooled across attempts. The transports share
//! one interactive shell implementation that detects prompts, answers
//! pagination and login prompts, and returns command output with the echo
//! and trailing prompt removed.
//!
//! # Main Components
//!
//! - [`ConnectionManager`] - opens sessions with timeouts and Telnet fallback
//! - [`Connector`] - transport seam; [`NetworkConnector`] for real devices,
//!   [`ReplayConnector`] for recorded transcripts
//! - [`DeviceSession`] - command execution on an open session
//! - [`Output`] - result of one command

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::config::TimeoutConfig;
use crate::credential::{CredentialView, Secret};
use crate::error::{BackupError, ErrorKind, Result};
use crate::model::{Device, DeviceId, Protocol};
use crate::prompt::{InputKind, LineClass, PromptHandler, clean_line};

pub use manager::{ConnectionManager, NetworkConnector};
pub use replay::{
    DeviceScript, ReplayConnector, TranscriptEntry, TranscriptEvent, parse_transcript,
};
pub use security::{ConnectionSecurityOptions, SecurityLevel};

/// The output of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// False when the device reported an error line.
    pub success: bool,
    /// Output without the echoed command and trailing prompt.
    pub content: String,
    /// First error line reported by the device, if any.
    #[serde(default)]
    pub error_line: Option<String>,
}

impl Output {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error_line: None,
        }
    }

    pub fn rejected(error_line: impl Into<String>) -> Self {
        let line = error_line.into();
        Self {
            success: false,
            content: line.clone(),
            error_line: Some(line),
        }
    }
}

/// Everything a transport needs to open one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub device: Arc<Device>,
    pub protocol: Protocol,
    pub port: u16,
    pub credential: CredentialView,
    pub handler: PromptHandler,
    pub timeouts: TimeoutConfig,
}

impl SessionRequest {
    pub fn new(
        device: Arc<Device>,
        credential: CredentialView,
        handler: PromptHandler,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            protocol: device.protocol,
            port: device.port,
            device,
            credential,
            handler,
            timeouts,
        }
    }

    /// `user@address:port`, used in logs.
    pub fn peer(&self) -> String {
        format!(
            "{}@{}:{}",
            self.credential.username, self.device.address, self.port
        )
    }
}

/// An open, logged-in session on one device.
#[async_trait]
pub trait DeviceSession: Send {
    /// Sends one command and waits for the prompt.
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<Output>;

    /// Runs the privilege escalation command, answering the enable prompt.
    /// Any rejection is `AuthFailed`.
    async fn escalate(&mut self, command: &str, timeout: Duration) -> Result<()>;

    /// Ends the session. Errors while closing are logged, not returned.
    async fn close(&mut self);
}

/// Opens transport sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn DeviceSession>>;
}

mod manager;
mod replay;
mod security;
mod shell;
mod ssh;
mod telnet;
