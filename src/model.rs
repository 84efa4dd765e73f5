//! Read models supplied by the administrative surface.
//!
//! Devices, groups and job definitions are finalized, immutable views. The
//! engine references them through `Arc` and never writes them back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::TimeoutConfig;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Stable device identity; also the lease key.
    DeviceId
);
string_id!(DeviceGroupId);
string_id!(JobId);
string_id!(
    /// Reference into the external credential store.
    CredentialProfileId
);

/// Transport used to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Ssh,
    Telnet,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ssh => 22,
            Protocol::Telnet => 23,
        }
    }
}

/// A network element addressed for read-only configuration capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// IP address or FQDN.
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Retry over Telnet when SSH cannot be reached.
    #[serde(default)]
    pub telnet_fallback: bool,
    /// Vendor tag, e.g. `cisco_ios`.
    pub vendor: String,
    pub credential_profile: CredentialProfileId,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Device {
    /// Builds an active SSH device on the default port.
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        vendor: impl Into<String>,
        credential_profile: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: DeviceId(id),
            address: address.into(),
            port: Protocol::Ssh.default_port(),
            protocol: Protocol::Ssh,
            telnet_fallback: false,
            vendor: vendor.into(),
            credential_profile: CredentialProfileId(credential_profile.into()),
            active: true,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self.port = protocol.default_port();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `address:port`, used in logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A named set of devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: DeviceGroupId,
    pub name: String,
    pub devices: Vec<DeviceId>,
}

/// Per-job capture options layered over the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Operator-supplied command list for the generic driver.
    pub commands: Vec<String>,
    /// Retries after the first attempt; engine default when unset.
    pub max_retries: Option<u32>,
    /// Worker pool size; engine default when unset.
    pub concurrency: Option<usize>,
    /// Timeout overrides; engine defaults when unset.
    pub timeouts: Option<TimeoutConfig>,
}

/// Schedule declaration: which devices, when, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceId>,
    #[serde(default)]
    pub groups: Vec<DeviceGroupId>,
    /// Five-field cron expression, evaluated in UTC.
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub options: CaptureOptions,
}

impl JobDefinition {
    /// A daily 02:00 job with no targets.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: JobId(id.into()),
            name: name.into(),
            devices: Vec::new(),
            groups: Vec::new(),
            schedule: "0 2 * * *".to_string(),
            enabled: true,
            options: CaptureOptions::default(),
        }
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = devices.into_iter().map(|d| DeviceId(d.into())).collect();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups
            .into_iter()
            .map(|g| DeviceGroupId(g.into()))
            .collect();
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }
}

/// Shared handle to an immutable device view.
pub type DeviceRef = Arc<Device>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults_to_active_ssh() {
        let device = Device::new("core-1", "10.0.0.1", "cisco_ios", "ro");
        assert_eq!(device.port, 22);
        assert_eq!(device.protocol, Protocol::Ssh);
        assert!(device.active);
        assert_eq!(device.endpoint(), "10.0.0.1:22");
    }

    #[test]
    fn telnet_protocol_switches_default_port() {
        let device = Device::new("old-1", "10.0.0.2", "cisco_ios", "ro").with_protocol(Protocol::Telnet);
        assert_eq!(device.port, 23);
    }

    #[test]
    fn job_definition_deserializes_with_defaults() {
        let job: JobDefinition = serde_json::from_str(
            r#"{"id":"nightly","name":"Nightly","schedule":"0 2 * * *","devices":["a"]}"#,
        )
        .expect("decode job");
        assert!(job.enabled);
        assert!(job.groups.is_empty());
        assert_eq!(job.devices, vec![DeviceId::from("a")]);
        assert_eq!(job.options, CaptureOptions::default());
    }
}
