//! Line classification for interactive device shells.
//!
//! A [`PromptHandler`] is compiled once per vendor profile from regex tables
//! and cloned into every session. It answers three questions about the text
//! coming back from a device: is this the CLI prompt, is the device asking
//! for input (login, password, pagination), and does this line report an
//! error or an authentication failure.

use std::borrow::Cow;
use std::collections::HashMap;

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Regex tables describing one vendor's CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PromptPatterns {
    /// CLI prompts; anchored to the start of the line automatically.
    pub prompts: Vec<String>,
    /// Pagination markers answered with a space.
    pub more: Vec<String>,
    /// Lines reporting a rejected or unknown command.
    pub errors: Vec<String>,
    /// Error lines that are harmless and must not fail the command.
    pub ignore_errors: Vec<String>,
    /// Login or privilege escalation rejected.
    pub auth_failures: Vec<String>,
    /// In-band username prompt (Telnet login).
    pub username: Vec<String>,
    /// In-band password prompt (Telnet login, enable).
    pub password: Vec<String>,
}

/// Input a device is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Username,
    Password,
    More,
}

/// Classification of one line of device output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Output,
    Prompt,
    Error,
    AuthFailure,
    Input(InputKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    More,
    AuthFailure,
    Error,
    Username,
    Password,
    Prompt,
}

/// Compiled prompt and error matcher for one vendor.
#[derive(Debug, Clone)]
pub struct PromptHandler {
    /// Combined set; the lowest matching index wins, so table order is priority.
    all_regex: RegexSet,
    slots: HashMap<usize, Slot>,
    ignore_errors: Option<RegexSet>,
    /// Unanchored pagination matcher used to scrub markers out of lines.
    more_scrub: Option<Regex>,
    current_prompt: Option<String>,
}

/// Carriage returns and backspace runs left at the start of a line by
/// pagination redraws.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

/// ANSI CSI escape sequences (colors, cursor moves).
pub static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[()][A-Za-z0-9]") {
        Ok(re) => re,
        Err(err) => panic!("invalid ANSI_ESCAPE regex: {err}"),
    });

impl PromptHandler {
    pub fn new(patterns: &PromptPatterns) -> Result<Self> {
        if patterns.prompts.is_empty() {
            return Err(BackupError::InvalidConfig(
                "prompt table must contain at least one prompt pattern".to_string(),
            ));
        }

        let mut regexs: Vec<String> = Vec::new();
        let mut slots = HashMap::new();

        let mut push = |list: &[String], slot: Slot, anchor: bool| {
            for pattern in list {
                let pattern = if anchor {
                    format!(r"^\x00*\r{{0,1}}{}", pattern.trim_start_matches('^'))
                } else {
                    pattern.clone()
                };
                slots.insert(regexs.len(), slot);
                regexs.push(pattern);
            }
        };

        push(&patterns.more, Slot::More, false);
        push(&patterns.auth_failures, Slot::AuthFailure, false);
        push(&patterns.errors, Slot::Error, false);
        push(&patterns.username, Slot::Username, false);
        push(&patterns.password, Slot::Password, false);
        push(&patterns.prompts, Slot::Prompt, true);

        let all_regex = RegexSet::new(&regexs).map_err(|err| {
            BackupError::InvalidConfig(format!("failed to build prompt regex set: {err}"))
        })?;

        let ignore_errors = if patterns.ignore_errors.is_empty() {
            None
        } else {
            Some(RegexSet::new(&patterns.ignore_errors).map_err(|err| {
                BackupError::InvalidConfig(format!("invalid ignore_errors regex set: {err}"))
            })?)
        };

        let more_scrub = if patterns.more.is_empty() {
            None
        } else {
            let joined = patterns
                .more
                .iter()
                .map(|p| format!("(?:{})", p.trim_start_matches('^').trim_end_matches('$')))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&joined).map_err(|err| {
                BackupError::InvalidConfig(format!("invalid pagination regex: {err}"))
            })?)
        };

        Ok(Self {
            all_regex,
            slots,
            ignore_errors,
            more_scrub,
            current_prompt: None,
        })
    }

    /// Classifies one line (complete or the trailing partial line).
    pub fn classify(&self, line: &str) -> LineClass {
        let Some(index) = self.all_regex.matches(line).into_iter().next() else {
            return LineClass::Output;
        };
        let class = match self.slots.get(&index).copied() {
            Some(Slot::More) => LineClass::Input(InputKind::More),
            Some(Slot::AuthFailure) => LineClass::AuthFailure,
            Some(Slot::Error) if self.ignore_error(line) => LineClass::Output,
            Some(Slot::Error) => LineClass::Error,
            Some(Slot::Username) => LineClass::Input(InputKind::Username),
            Some(Slot::Password) => LineClass::Input(InputKind::Password),
            Some(Slot::Prompt) => LineClass::Prompt,
            None => LineClass::Output,
        };
        trace!("classified {line:?} as {class:?}");
        class
    }

    fn ignore_error(&self, line: &str) -> bool {
        self.ignore_errors
            .as_ref()
            .map(|set| set.is_match(line))
            .unwrap_or(false)
    }

    /// Checks whether the partial line is the CLI prompt and remembers it.
    pub fn read_prompt(&mut self, line: &str) -> bool {
        if self.classify(line) == LineClass::Prompt {
            self.current_prompt = Some(line.trim_end().to_string());
            return true;
        }
        false
    }

    /// Returns the input the device waits for, if any.
    pub fn input_required(&self, line: &str) -> Option<InputKind> {
        match self.classify(line) {
            LineClass::Input(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_error(&self, line: &str) -> bool {
        self.classify(line) == LineClass::Error
    }

    pub fn is_auth_failure(&self, line: &str) -> bool {
        self.classify(line) == LineClass::AuthFailure
    }

    /// Removes pagination markers left inside a completed line.
    pub fn scrub_more<'a>(&self, line: &'a str) -> Cow<'a, str> {
        match self.more_scrub.as_ref() {
            Some(re) => re.replace_all(line, ""),
            None => Cow::Borrowed(line),
        }
    }

    /// Last prompt text matched.
    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }
}

/// Strips ANSI escapes, NUL padding and redraw prefixes from raw shell text.
pub fn clean_line(line: &str) -> String {
    let no_ansi = ANSI_ESCAPE.replace_all(line, "");
    let trimmed = IGNORE_START_LINE.replace(&no_ansi, "");
    trimmed.replace('\0', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_handler() -> PromptHandler {
        PromptHandler::new(&PromptPatterns {
            prompts: vec![r"[\w.-]+[>#]\s*$".to_string()],
            more: vec![r"\s*--More--\s*".to_string()],
            errors: vec![r"^% Invalid input".to_string(), r"^% Unknown".to_string()],
            ignore_errors: vec![r"^% Unknown VPN".to_string()],
            auth_failures: vec![r"(?i)authentication failed".to_string()],
            username: vec![r"(?i)username:\s*$".to_string()],
            password: vec![r"(?i)password:\s*$".to_string()],
        })
        .expect("test handler config should be valid")
    }

    #[test]
    fn prompt_is_detected_and_remembered() {
        let mut handler = build_test_handler();
        assert!(handler.read_prompt("core-sw1#"));
        assert_eq!(handler.current_prompt(), Some("core-sw1#"));
        assert!(!handler.read_prompt("interface Gi0/1"));
    }

    #[test]
    fn error_lines_are_classified_unless_ignored() {
        let handler = build_test_handler();
        assert!(handler.is_error("% Invalid input detected at '^' marker."));
        assert!(!handler.is_error("% Unknown VPN"));
        assert_eq!(handler.classify("hostname core-sw1"), LineClass::Output);
    }

    #[test]
    fn input_prompts_are_recognized() {
        let handler = build_test_handler();
        assert_eq!(handler.input_required("Username: "), Some(InputKind::Username));
        assert_eq!(handler.input_required("Password:"), Some(InputKind::Password));
        assert_eq!(handler.input_required(" --More-- "), Some(InputKind::More));
        assert_eq!(handler.input_required("core-sw1#"), None);
    }

    #[test]
    fn auth_failure_takes_priority_over_prompt() {
        let handler = build_test_handler();
        assert!(handler.is_auth_failure("% Authentication failed"));
    }

    #[test]
    fn pagination_markers_are_scrubbed() {
        let handler = build_test_handler();
        assert_eq!(handler.scrub_more(" --More-- ntp server 1.1.1.1"), "ntp server 1.1.1.1");
    }

    #[test]
    fn clean_line_strips_escapes_and_backspaces() {
        assert_eq!(clean_line("\x1b[1mhostname r1\x1b[0m"), "hostname r1");
        assert_eq!(clean_line("\u{8}\u{8}\u{8}   \u{8}\u{8}\u{8}ip route"), "ip route");
    }

    #[test]
    fn empty_prompt_table_is_rejected() {
        let err = PromptHandler::new(&PromptPatterns::default()).expect_err("no prompts");
        assert!(matches!(err, BackupError::InvalidConfig(_)));
    }
}
