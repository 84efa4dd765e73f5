//! Line-level diff between two configuration texts.
//!
//! Common leading and trailing lines are stripped first; the remaining
//! window is compared with a longest-common-subsequence table. Configuration
//! changes are usually small, so the window stays small even for very long
//! configurations.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// Above this many table cells the window is reported as a full replacement.
const MAX_LCS_CELLS: usize = 16_000_000;

/// One line of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", content = "line", rename_all = "snake_case")]
pub enum DiffLine {
    Unchanged(String),
    Added(String),
    Removed(String),
}

impl DiffLine {
    pub fn text(&self) -> &str {
        match self {
            DiffLine::Unchanged(l) | DiffLine::Added(l) | DiffLine::Removed(l) => l,
        }
    }
}

/// Change counters; `changed` pairs removals with additions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Diff of a snapshot against its baseline. `from` is `None` for a
/// device's first snapshot, where every line is an addition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub from: Option<Uuid>,
    pub to: Uuid,
    pub lines: Vec<DiffLine>,
    pub summary: DiffSummary,
}

impl Diff {
    pub fn compute(from: Option<Uuid>, to: Uuid, old: &str, new: &str) -> Self {
        let lines = diff_lines(old, new);
        let summary = summarize(&lines);
        Self {
            from,
            to,
            lines,
            summary,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    /// Unified diff text with `context` lines around each hunk.
    pub fn render_unified(&self, old_label: &str, new_label: &str, context: usize) -> String {
        render_unified(&self.lines, old_label, new_label, context)
    }
}

fn split(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.lines().collect()
    }
}

/// Ordered additions, removals and unchanged context from `old` to `new`.
pub fn diff_lines(old: &str, new: &str) -> Vec<DiffLine> {
    let a = split(old);
    let b = split(new);

    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut out = Vec::with_capacity(a.len().max(b.len()));
    out.extend(a[..prefix].iter().map(|l| DiffLine::Unchanged(l.to_string())));
    diff_window(&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix], &mut out);
    out.extend(
        a[a.len() - suffix..]
            .iter()
            .map(|l| DiffLine::Unchanged(l.to_string())),
    );
    out
}

fn diff_window(a: &[&str], b: &[&str], out: &mut Vec<DiffLine>) {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 || n.saturating_mul(m) > MAX_LCS_CELLS {
        out.extend(a.iter().map(|l| DiffLine::Removed(l.to_string())));
        out.extend(b.iter().map(|l| DiffLine::Added(l.to_string())));
        return;
    }

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if a[i] == b[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            out.push(DiffLine::Unchanged(a[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            out.push(DiffLine::Removed(a[i].to_string()));
            i += 1;
        } else {
            out.push(DiffLine::Added(b[j].to_string()));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|l| DiffLine::Removed(l.to_string())));
    out.extend(b[j..].iter().map(|l| DiffLine::Added(l.to_string())));
}

fn summarize(lines: &[DiffLine]) -> DiffSummary {
    let added = lines
        .iter()
        .filter(|l| matches!(l, DiffLine::Added(_)))
        .count();
    let removed = lines
        .iter()
        .filter(|l| matches!(l, DiffLine::Removed(_)))
        .count();
    DiffSummary {
        added,
        removed,
        changed: added.min(removed),
    }
}

fn render_unified(lines: &[DiffLine], old_label: &str, new_label: &str, context: usize) -> String {
    let changed: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| !matches!(l, DiffLine::Unchanged(_)))
        .map(|(idx, _)| idx)
        .collect();
    if changed.is_empty() {
        return String::new();
    }

    // Merge change positions into hunks [start, end).
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for idx in changed {
        let start = idx.saturating_sub(context);
        let end = (idx + 1 + context).min(lines.len());
        match hunks.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => hunks.push((start, end)),
        }
    }

    // 1-based line numbers at each diff position.
    let mut old_no = Vec::with_capacity(lines.len() + 1);
    let mut new_no = Vec::with_capacity(lines.len() + 1);
    let (mut o, mut n) = (1usize, 1usize);
    for line in lines {
        old_no.push(o);
        new_no.push(n);
        match line {
            DiffLine::Unchanged(_) => {
                o += 1;
                n += 1;
            }
            DiffLine::Removed(_) => o += 1,
            DiffLine::Added(_) => n += 1,
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "--- {old_label}");
    let _ = writeln!(out, "+++ {new_label}");
    for (start, end) in hunks {
        let slice = &lines[start..end];
        let old_len = slice
            .iter()
            .filter(|l| !matches!(l, DiffLine::Added(_)))
            .count();
        let new_len = slice
            .iter()
            .filter(|l| !matches!(l, DiffLine::Removed(_)))
            .count();
        let old_start = if old_len == 0 { old_no[start] - 1 } else { old_no[start] };
        let new_start = if new_len == 0 { new_no[start] - 1 } else { new_no[start] };
        let _ = writeln!(out, "@@ -{old_start},{old_len} +{new_start},{new_len} @@");
        for line in slice {
            let marker = match line {
                DiffLine::Unchanged(_) => ' ',
                DiffLine::Added(_) => '+',
                DiffLine::Removed(_) => '-',
            };
            let _ = writeln!(out, "{marker}{}", line.text());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_replacement_keeps_context() {
        let lines = diff_lines("line1\nline2", "line1\nline3");
        assert_eq!(
            lines,
            vec![
                DiffLine::Unchanged("line1".to_string()),
                DiffLine::Removed("line2".to_string()),
                DiffLine::Added("line3".to_string()),
            ]
        );
        let summary = summarize(&lines);
        assert_eq!(
            summary,
            DiffSummary {
                added: 1,
                removed: 1,
                changed: 1
            }
        );
    }

    #[test]
    fn first_snapshot_is_all_additions() {
        let diff = Diff::compute(None, Uuid::new_v4(), "", "a\nb\nc");
        assert_eq!(diff.summary.added, 3);
        assert_eq!(diff.summary.removed, 0);
        assert!(diff.lines.iter().all(|l| matches!(l, DiffLine::Added(_))));
    }

    #[test]
    fn identical_text_has_empty_diff() {
        let diff = Diff::compute(None, Uuid::new_v4(), "a\nb", "a\nb");
        assert!(diff.is_empty());
        assert_eq!(diff.render_unified("a", "b", 3), "");
    }

    #[test]
    fn interleaved_changes_follow_lcs() {
        let lines = diff_lines("a\nb\nc\nd\ne", "a\nc\nd\nx\ne");
        let ops: Vec<String> = lines
            .iter()
            .map(|l| match l {
                DiffLine::Unchanged(t) => format!(" {t}"),
                DiffLine::Added(t) => format!("+{t}"),
                DiffLine::Removed(t) => format!("-{t}"),
            })
            .collect();
        assert_eq!(ops, vec![" a", "-b", " c", " d", "+x", " e"]);
    }

    #[test]
    fn unified_rendering_has_hunk_headers() {
        let old = (1..=10).map(|i| format!("l{i}")).collect::<Vec<_>>().join("\n");
        let new = old.replace("l5", "L5");
        let diff = Diff::compute(None, Uuid::new_v4(), &old, &new);
        let text = diff.render_unified("old", "new", 2);
        assert!(text.starts_with("--- old\n+++ new\n"));
        assert!(text.contains("@@ -3,5 +3,5 @@"));
        assert!(text.contains("-l5\n+L5\n"));
        assert!(!text.contains("l1\n"));
    }
}
