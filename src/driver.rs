//! Vendor drivers and the driver registry.
//!
//! The registry is built once from the built-in vendor tables plus operator
//! overrides and shared read-only across all tasks. A [`Driver`] is a cheap
//! handle onto one compiled profile; it only ever issues the commands in its
//! tables (or, for the generic driver, the job's command list), and every
//! operator-supplied command passes the read-only guard first.

use log::debug;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::VendorOverride;
use crate::credential::CredentialView;
use crate::error::{BackupError, Result};
use crate::model::CaptureOptions;
use crate::prompt::PromptHandler;
use crate::session::Output;
use crate::vendor::{Vendor, VendorProfile, builtin_profile};

/// First words of commands that change device state.
const MUTATING_VERBS: &[&str] = &[
    "configure", "conf", "config", "write", "wr", "copy", "delete", "del", "erase", "format",
    "reload", "reboot", "restart", "shutdown", "halt", "poweroff", "commit", "rollback",
    "request", "edit", "execute", "set", "unset", "no", "clear", "debug", "undebug", "save",
    "load", "install", "upgrade", "rm", "rmdir", "mv", "cp", "dd", "mkfs", "tee", "truncate",
    "chmod", "chown", "kill", "killall",
];

/// Display-only forms of otherwise mutating verbs.
const READ_ONLY_EXCEPTIONS: &[&str] = &["set cli "];

static SEGMENT_SPLIT: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\|\||&&|[|;\n]") {
    Ok(re) => re,
    Err(err) => panic!("invalid SEGMENT_SPLIT regex: {err}"),
});

static NULL_REDIRECT: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\d?>\s*/dev/null|\d>&\d") {
    Ok(re) => re,
    Err(err) => panic!("invalid NULL_REDIRECT regex: {err}"),
});

/// Rejects commands that could modify a device.
///
/// Every pipeline or list segment is checked on its first word; output
/// redirection is only allowed into `/dev/null`.
pub fn ensure_read_only(command: &str) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(BackupError::UnsupportedCommand(
            "empty command".to_string(),
        ));
    }
    let without_null = NULL_REDIRECT.replace_all(trimmed, "");
    if without_null.contains('>') || without_null.contains('`') || without_null.contains("$(") {
        return Err(BackupError::UnsupportedCommand(format!(
            "'{trimmed}' writes output or runs a subshell"
        )));
    }

    for segment in SEGMENT_SPLIT.split(&without_null) {
        let mut segment = segment.trim().to_ascii_lowercase();
        if let Some(rest) = segment.strip_prefix("sudo ") {
            segment = rest.trim_start().to_string();
        }
        if segment.is_empty() {
            continue;
        }
        if READ_ONLY_EXCEPTIONS.iter().any(|p| segment.starts_with(p)) {
            continue;
        }
        let verb = segment.split_whitespace().next().unwrap_or_default();
        if MUTATING_VERBS.contains(&verb) {
            return Err(BackupError::UnsupportedCommand(format!(
                "'{trimmed}' is not read-only ('{verb}')"
            )));
        }
    }
    Ok(())
}

/// Normalizes captured text before hashing.
///
/// Line endings are unified, trailing whitespace is trimmed, volatile lines
/// are dropped and blank lines at both edges are removed.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    drop: Option<RegexSet>,
}

impl Sanitizer {
    pub fn new(drop_line_patterns: &[String]) -> Result<Self> {
        let drop = if drop_line_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(drop_line_patterns).map_err(|e| {
                BackupError::InvalidConfig(format!("invalid drop_line_patterns: {e}"))
            })?)
        };
        Ok(Self { drop })
    }

    pub fn sanitize(&self, raw: &str) -> String {
        let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
        let lines: Vec<&str> = normalized
            .lines()
            .map(str::trim_end)
            .filter(|line| {
                self.drop
                    .as_ref()
                    .map(|set| !set.is_match(line))
                    .unwrap_or(true)
            })
            .collect();

        let start = lines.iter().position(|l| !l.is_empty());
        let end = lines.iter().rposition(|l| !l.is_empty());
        match (start, end) {
            (Some(start), Some(end)) => lines[start..=end].join("\n"),
            _ => String::new(),
        }
    }
}

/// Profile tables with their regexes compiled.
#[derive(Debug)]
struct CompiledProfile {
    profile: VendorProfile,
    handler: PromptHandler,
    sanitizer: Sanitizer,
}

impl CompiledProfile {
    fn compile(profile: VendorProfile) -> Result<Self> {
        let handler = PromptHandler::new(&profile.patterns)?;
        let sanitizer = Sanitizer::new(&profile.drop_line_patterns)?;
        Ok(Self {
            profile,
            handler,
            sanitizer,
        })
    }
}

/// Command source for one task.
#[derive(Debug, Clone)]
pub struct Driver {
    compiled: Arc<CompiledProfile>,
    capture_commands: Vec<String>,
}

impl Driver {
    pub fn vendor(&self) -> Vendor {
        self.compiled.profile.vendor
    }

    pub fn setup_commands(&self) -> &[String] {
        &self.compiled.profile.setup_commands
    }

    pub fn capture_commands(&self) -> &[String] {
        &self.capture_commands
    }

    pub fn info_commands(&self) -> &BTreeMap<String, String> {
        &self.compiled.profile.info_commands
    }

    pub fn additional_commands(&self) -> &[String] {
        &self.compiled.profile.additional_commands
    }

    /// Fresh prompt matcher for one session.
    pub fn prompt_handler(&self) -> PromptHandler {
        self.compiled.handler.clone()
    }

    /// Privilege escalation command, when the credential carries an enable
    /// secret and the vendor supports it.
    pub fn escalation_command(&self, credential: &CredentialView) -> Result<Option<String>> {
        if credential.enable_secret.is_none() {
            return Ok(None);
        }
        match credential.enable_command.as_deref() {
            Some(custom) => {
                ensure_read_only(custom)?;
                Ok(Some(custom.trim().to_string()))
            }
            None => Ok(self.compiled.profile.enable_command.clone()),
        }
    }

    /// Maps device-reported errors to a failure kind.
    pub fn classify_output(&self, command: &str, output: &Output) -> Result<()> {
        if output.success {
            return Ok(());
        }
        let line = output.error_line.as_deref().unwrap_or("command rejected");
        Err(BackupError::UnsupportedCommand(format!(
            "{} rejected '{command}': {line}",
            self.vendor()
        )))
    }

    pub fn sanitize(&self, raw: &str) -> String {
        self.compiled.sanitizer.sanitize(raw)
    }
}

/// All driver profiles, loaded once at startup.
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    profiles: HashMap<Vendor, Arc<CompiledProfile>>,
}

impl DriverRegistry {
    /// Registry with the built-in tables only.
    pub fn builtin() -> Result<Self> {
        Self::from_overrides(&BTreeMap::new())
    }

    /// Registry with operator overrides layered over the built-in tables.
    pub fn from_overrides(overrides: &BTreeMap<String, VendorOverride>) -> Result<Self> {
        for tag in overrides.keys() {
            if Vendor::from_tag(tag).is_none() {
                return Err(BackupError::InvalidConfig(format!(
                    "override for unknown vendor '{tag}'"
                )));
            }
        }

        let mut profiles = HashMap::new();
        for vendor in Vendor::ALL {
            let mut profile = builtin_profile(vendor);
            let over = overrides
                .iter()
                .find(|(tag, _)| Vendor::from_tag(tag) == Some(vendor))
                .map(|(_, over)| over);
            if let Some(over) = over {
                let commands = over
                    .setup_commands
                    .iter()
                    .chain(over.capture_commands.iter())
                    .chain(over.info_commands.values())
                    .chain(over.additional_commands.iter());
                for command in commands {
                    ensure_read_only(command).map_err(|e| {
                        BackupError::InvalidConfig(format!("{vendor} override: {}", e.detail()))
                    })?;
                }
                debug!("applying operator override for {vendor}");
                profile.apply_override(over);
            }
            profiles.insert(vendor, Arc::new(CompiledProfile::compile(profile)?));
        }
        Ok(Self { profiles })
    }

    /// Resolves the driver for a device's vendor tag.
    ///
    /// Unknown tags, and a generic device without a command list, are
    /// `UnsupportedCommand`.
    pub fn driver_for(&self, vendor_tag: &str, options: &CaptureOptions) -> Result<Driver> {
        let vendor: Vendor = vendor_tag.parse()?;
        let compiled = self.profiles.get(&vendor).cloned().ok_or_else(|| {
            BackupError::UnsupportedCommand(format!("no driver for vendor '{vendor_tag}'"))
        })?;

        let capture_commands = if vendor == Vendor::Generic {
            if options.commands.is_empty() {
                return Err(BackupError::UnsupportedCommand(
                    "generic driver requires a command list on the job".to_string(),
                ));
            }
            for command in &options.commands {
                ensure_read_only(command)?;
            }
            options.commands.clone()
        } else {
            if !options.commands.is_empty() {
                debug!("{vendor} uses its built-in capture commands; job command list ignored");
            }
            compiled.profile.capture_commands.clone()
        };

        Ok(Driver {
            compiled,
            capture_commands,
        })
    }

    /// Effective (overridden) profile for a vendor.
    pub fn profile(&self, vendor: Vendor) -> Option<&VendorProfile> {
        self.profiles.get(&vendor).map(|c| &c.profile)
    }
}
