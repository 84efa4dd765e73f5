//! Built-in vendor profiles.
//!
//! Each supported platform is described by a static table: the commands that
//! prepare the terminal, the read-only commands that produce the
//! configuration, optional info commands, prompt and error patterns, and the
//! volatile lines that must be dropped before hashing. Profiles are data; the
//! behaviour around them lives in [`crate::driver`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::VendorOverride;
use crate::error::BackupError;
use crate::prompt::PromptPatterns;

/// Vendor tags with a built-in profile.
pub const BUILTIN_VENDORS: &[&str] = &[
    "cisco_ios",
    "cisco_nxos",
    "cisco_asa",
    "juniper_junos",
    "arista_eos",
    "fortinet",
    "paloalto_panos",
    "linux",
    "generic",
];

/// Closed set of supported platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    CiscoIos,
    CiscoNxos,
    CiscoAsa,
    JuniperJunos,
    AristaEos,
    Fortinet,
    PaloaltoPanos,
    Linux,
    /// Operator-supplied command list, generic prompts.
    Generic,
}

impl Vendor {
    pub const ALL: [Vendor; 9] = [
        Vendor::CiscoIos,
        Vendor::CiscoNxos,
        Vendor::CiscoAsa,
        Vendor::JuniperJunos,
        Vendor::AristaEos,
        Vendor::Fortinet,
        Vendor::PaloaltoPanos,
        Vendor::Linux,
        Vendor::Generic,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Vendor::CiscoIos => "cisco_ios",
            Vendor::CiscoNxos => "cisco_nxos",
            Vendor::CiscoAsa => "cisco_asa",
            Vendor::JuniperJunos => "juniper_junos",
            Vendor::AristaEos => "arista_eos",
            Vendor::Fortinet => "fortinet",
            Vendor::PaloaltoPanos => "paloalto_panos",
            Vendor::Linux => "linux",
            Vendor::Generic => "generic",
        }
    }

    /// Looks up a vendor tag (case-insensitive). `ios` and `junos` style
    /// short aliases are accepted.
    pub fn from_tag(tag: &str) -> Option<Vendor> {
        let key = tag.trim().to_ascii_lowercase();
        let vendor = match key.as_str() {
            "cisco_ios" | "cisco_xe" | "ios" => Vendor::CiscoIos,
            "cisco_nxos" | "nxos" => Vendor::CiscoNxos,
            "cisco_asa" | "asa" => Vendor::CiscoAsa,
            "juniper_junos" | "juniper" | "junos" => Vendor::JuniperJunos,
            "arista_eos" | "eos" => Vendor::AristaEos,
            "fortinet" | "fortios" => Vendor::Fortinet,
            "paloalto_panos" | "panos" => Vendor::PaloaltoPanos,
            "linux" => Vendor::Linux,
            "generic" => Vendor::Generic,
            _ => return None,
        };
        Some(vendor)
    }

    pub fn family(self) -> VendorFamily {
        match self {
            Vendor::CiscoIos | Vendor::CiscoNxos => VendorFamily::IosLike,
            Vendor::AristaEos => VendorFamily::EosLike,
            Vendor::JuniperJunos => VendorFamily::JunosLike,
            Vendor::CiscoAsa | Vendor::Fortinet | Vendor::PaloaltoPanos => VendorFamily::Firewall,
            Vendor::Linux => VendorFamily::Host,
            Vendor::Generic => VendorFamily::Generic,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Vendor {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Vendor::from_tag(s)
            .ok_or_else(|| BackupError::UnsupportedCommand(format!("no driver for vendor '{s}'")))
    }
}

/// CLI family a vendor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VendorFamily {
    IosLike,
    JunosLike,
    EosLike,
    Firewall,
    Host,
    Generic,
}

/// Capability tags describing a vendor profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VendorCapability {
    /// Privilege escalation with an enable secret.
    EnableMode,
    /// Output is paged unless the terminal is configured.
    Pagination,
    /// Version and hostname are collected next to the configuration.
    DeviceInfo,
    /// Command list comes from the job definition.
    OperatorCommands,
}

/// Catalog entry for a built-in vendor profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VendorMetadata {
    pub tag: String,
    pub vendor: String,
    pub platform: String,
    pub family: VendorFamily,
    pub capabilities: Vec<VendorCapability>,
}

fn metadata_for(vendor: Vendor) -> VendorMetadata {
    use VendorCapability::*;
    let (name, platform, capabilities) = match vendor {
        Vendor::CiscoIos => ("Cisco", "IOS/IOS-XE", vec![EnableMode, Pagination, DeviceInfo]),
        Vendor::CiscoNxos => ("Cisco", "NX-OS", vec![Pagination, DeviceInfo]),
        Vendor::CiscoAsa => ("Cisco", "ASA", vec![EnableMode, Pagination, DeviceInfo]),
        Vendor::JuniperJunos => ("Juniper", "JunOS", vec![Pagination, DeviceInfo]),
        Vendor::AristaEos => ("Arista", "EOS", vec![EnableMode, Pagination, DeviceInfo]),
        Vendor::Fortinet => ("Fortinet", "FortiOS", vec![Pagination, DeviceInfo]),
        Vendor::PaloaltoPanos => ("Palo Alto Networks", "PAN-OS", vec![Pagination, DeviceInfo]),
        Vendor::Linux => ("Linux", "Linux", vec![DeviceInfo]),
        Vendor::Generic => ("Generic", "CLI", vec![Pagination, OperatorCommands]),
    };
    VendorMetadata {
        tag: vendor.tag().to_string(),
        vendor: name.to_string(),
        platform: platform.to_string(),
        family: vendor.family(),
        capabilities,
    }
}

/// Returns metadata for all built-in vendor profiles.
pub fn vendor_catalog() -> Vec<VendorMetadata> {
    Vendor::ALL.iter().map(|v| metadata_for(*v)).collect()
}

/// Static command and pattern table for one vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VendorProfile {
    pub vendor: Vendor,
    /// Terminal preparation; failures are tolerated.
    pub setup_commands: Vec<String>,
    /// Read-only commands whose output forms the snapshot.
    pub capture_commands: Vec<String>,
    /// Named informational commands (version, hostname).
    pub info_commands: BTreeMap<String, String>,
    /// Extra show commands captured into a separate history per device.
    #[serde(default)]
    pub additional_commands: Vec<String>,
    /// Privilege escalation command, used only with an enable secret.
    pub enable_command: Option<String>,
    pub patterns: PromptPatterns,
    /// Lines matching any of these are dropped before hashing.
    pub drop_line_patterns: Vec<String>,
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn info(list: &[(&str, &str)]) -> BTreeMap<String, String> {
    list.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

const LOGIN_USERNAME: &[&str] = &[r"(?i)(user ?name|login)\s*:\s*$"];
const LOGIN_PASSWORD: &[&str] = &[r"(?i)(enable )?password\s*:\s*$"];
const AUTH_FAILURES: &[&str] = &[
    r"(?i)authentication failed",
    r"(?i)login invalid",
    r"(?i)login incorrect",
    r"(?i)access denied",
    r"(?i)permission denied",
    r"(?i)% bad (passwords|secrets)",
];

fn ios_like_patterns() -> PromptPatterns {
    PromptPatterns {
        prompts: strings(&[r"[^\s#>]+(\(\S+\))?[#>]\s*$"]),
        more: strings(&[r"\s*--More--\s*", r"\s*<--- More --->\s*"]),
        errors: strings(&[
            r"% Invalid input detected",
            r"% Incomplete command",
            r"% Ambiguous command",
            r"% Unknown command",
            r"^Command authorization failed.*",
            r"^Command rejected:.*",
        ]),
        ignore_errors: Vec::new(),
        auth_failures: strings(AUTH_FAILURES),
        username: strings(LOGIN_USERNAME),
        password: strings(LOGIN_PASSWORD),
    }
}

/// Returns the built-in table for a vendor.
pub fn builtin_profile(vendor: Vendor) -> VendorProfile {
    match vendor {
        Vendor::CiscoIos => VendorProfile {
            vendor,
            setup_commands: strings(&["terminal length 0", "terminal width 512"]),
            capture_commands: strings(&["show running-config"]),
            info_commands: info(&[
                ("version", "show version | include Version"),
                ("hostname", "show running-config | include ^hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: Some("enable".to_string()),
            patterns: ios_like_patterns(),
            drop_line_patterns: strings(&[
                r"^Building configuration",
                r"^Current configuration\s*:",
                r"^!Time:",
                r"^! Last configuration change",
                r"^! NVRAM config last updated",
                r"^ntp clock-period",
            ]),
        },
        Vendor::CiscoNxos => VendorProfile {
            vendor,
            setup_commands: strings(&["terminal length 0", "terminal width 511"]),
            capture_commands: strings(&["show running-config"]),
            info_commands: info(&[
                ("version", "show version | include NXOS"),
                ("hostname", "show hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: ios_like_patterns(),
            drop_line_patterns: strings(&[r"^!Time:", r"^!Running configuration last done at:"]),
        },
        Vendor::CiscoAsa => VendorProfile {
            vendor,
            setup_commands: strings(&["terminal pager 0"]),
            capture_commands: strings(&["show running-config"]),
            info_commands: info(&[
                ("version", "show version | include Version"),
                ("hostname", "show hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: Some("enable".to_string()),
            patterns: PromptPatterns {
                prompts: strings(&[r"[^\s#>]+(\(\S+\))?[#>]\s*$"]),
                more: strings(&[r"\s*<--- More --->\s*"]),
                errors: strings(&[r"^ERROR: .+", r"% Invalid input detected"]),
                ..ios_like_patterns()
            },
            drop_line_patterns: strings(&[
                r"^: Saved",
                r"^: Written by",
                r"^Cryptochecksum:",
                r"^: end$",
            ]),
        },
        Vendor::JuniperJunos => VendorProfile {
            vendor,
            setup_commands: strings(&["set cli screen-length 0", "set cli screen-width 0"]),
            capture_commands: strings(&["show configuration | display set"]),
            info_commands: info(&[
                ("version", "show version | match Junos:"),
                ("hostname", "show version | match Hostname:"),
            ]),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: PromptPatterns {
                prompts: strings(&[r"([\w.-]+@)?[\w.-]+[>#%]\s*$"]),
                more: strings(&[r"---\(more( \d+%)?\)---"]),
                errors: strings(&[r"^\s*unknown command", r"^\s*syntax error", r"^error:"]),
                ignore_errors: Vec::new(),
                auth_failures: strings(AUTH_FAILURES),
                username: strings(LOGIN_USERNAME),
                password: strings(LOGIN_PASSWORD),
            },
            drop_line_patterns: strings(&[r"^## Last commit:", r"^## Last changed:"]),
        },
        Vendor::AristaEos => VendorProfile {
            vendor,
            setup_commands: strings(&["terminal length 0", "terminal width 32767"]),
            capture_commands: strings(&["show running-config"]),
            info_commands: info(&[
                ("version", "show version | include Software image version"),
                ("hostname", "show hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: Some("enable".to_string()),
            patterns: ios_like_patterns(),
            drop_line_patterns: strings(&[
                r"^! Command: show running-config",
                r"^! Startup-config last modified",
                r"^! device: ",
            ]),
        },
        Vendor::Fortinet => VendorProfile {
            vendor,
            setup_commands: Vec::new(),
            capture_commands: strings(&["show"]),
            info_commands: info(&[
                ("version", "get system status | grep Version"),
                ("hostname", "get system status | grep Hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: PromptPatterns {
                prompts: strings(&[r"[\w.-]+( \([\w.-]+\))? [#$]\s*$"]),
                more: strings(&[r"\s*--More--\s*"]),
                errors: strings(&[r"^Unknown action", r"^command parse error", r"^Command fail"]),
                ignore_errors: Vec::new(),
                auth_failures: strings(AUTH_FAILURES),
                username: strings(LOGIN_USERNAME),
                password: strings(LOGIN_PASSWORD),
            },
            drop_line_patterns: strings(&[r"^#conf_file_ver=", r"^#buildno=", r"^#global_vdom="]),
        },
        Vendor::PaloaltoPanos => VendorProfile {
            vendor,
            setup_commands: strings(&["set cli pager off"]),
            capture_commands: strings(&["show config running"]),
            info_commands: info(&[
                ("version", "show system info | match sw-version"),
                ("hostname", "show system info | match hostname"),
            ]),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: PromptPatterns {
                prompts: strings(&[r"[\w.-]+@[\w.-]+(\([\w.-]+\))?[>#]\s*$"]),
                more: strings(&[r"\s*lines \d+-\d+\s*", r"\s*--more--\s*"]),
                errors: strings(&[r"^Unknown command", r"^Invalid syntax", r"^Server error"]),
                ignore_errors: Vec::new(),
                auth_failures: strings(AUTH_FAILURES),
                username: strings(LOGIN_USERNAME),
                password: strings(LOGIN_PASSWORD),
            },
            drop_line_patterns: Vec::new(),
        },
        Vendor::Linux => VendorProfile {
            vendor,
            setup_commands: strings(&["export TERM=dumb", "unalias -a"]),
            capture_commands: strings(&[
                "cat /etc/hostname 2>/dev/null || hostname",
                "cat /etc/network/interfaces 2>/dev/null || ip addr show",
                "cat /etc/resolv.conf 2>/dev/null",
            ]),
            info_commands: info(&[("hostname", "hostname"), ("version", "uname -sr")]),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: PromptPatterns {
                prompts: strings(&[r"\S*[$#]\s*$"]),
                more: Vec::new(),
                errors: strings(&[r": command not found$", r"^-?\w*sh: .*not found"]),
                ignore_errors: Vec::new(),
                auth_failures: strings(AUTH_FAILURES),
                username: strings(LOGIN_USERNAME),
                password: strings(&[r"(?i)password( for \S+)?\s*:\s*$"]),
            },
            drop_line_patterns: strings(&[r"^# Generated by NetworkManager"]),
        },
        Vendor::Generic => VendorProfile {
            vendor,
            setup_commands: Vec::new(),
            capture_commands: Vec::new(),
            info_commands: BTreeMap::new(),
            additional_commands: Vec::new(),
            enable_command: None,
            patterns: PromptPatterns {
                prompts: strings(&[r"\S*[>#$%]\s*$"]),
                more: strings(&[r"(?i)\s*-+\s*\(?more\b[^-]*-+\s*"]),
                errors: strings(&[
                    r"% Invalid input",
                    r"(?i)^% ?unknown command",
                    r"(?i)^\s*(unknown|invalid) command",
                    r"(?i)command not found",
                ]),
                ignore_errors: Vec::new(),
                auth_failures: strings(AUTH_FAILURES),
                username: strings(LOGIN_USERNAME),
                password: strings(LOGIN_PASSWORD),
            },
            drop_line_patterns: Vec::new(),
        },
    }
}

impl VendorProfile {
    /// Layers operator overrides over the built-in table. Non-empty lists
    /// replace the built-in lists; drop patterns are appended.
    pub fn apply_override(&mut self, over: &VendorOverride) {
        if !over.setup_commands.is_empty() {
            self.setup_commands = over.setup_commands.clone();
        }
        if !over.capture_commands.is_empty() {
            self.capture_commands = over.capture_commands.clone();
        }
        if !over.info_commands.is_empty() {
            self.info_commands = over.info_commands.clone();
        }
        if !over.additional_commands.is_empty() {
            self.additional_commands = over.additional_commands.clone();
        }
        self.drop_line_patterns
            .extend(over.drop_line_patterns.iter().cloned());
    }
}
