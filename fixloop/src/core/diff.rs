//! Unified-diff shape checks and summaries.
//!
//! Patches are validated by prefix only; the apply step is the real grammar check.

/// True when `text` starts like a unified diff (`diff --git` or `---`).
pub fn is_unified_diff(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("diff --git") || trimmed.starts_with("---")
}

/// Strip a single surrounding Markdown code fence, if present.
///
/// Models often wrap diffs or tool JSON in ```` ```diff ```` fences even when told not to.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (`diff`, `json`, ...) on the opening line.
    match body.split_once('\n') {
        Some((info, inner)) if !info.contains(' ') => inner.trim_matches('\n'),
        _ => body.trim(),
    }
}

/// Files touched by a diff, taken from `+++ b/<path>` headers (or `--- a/<path>` for deletions).
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for change in file_changes(diff) {
        if let Some(path) = change.path {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

/// One line per touched file: `path (+added -removed)`.
pub fn summarize_diff(diff: &str) -> String {
    file_changes(diff)
        .iter()
        .map(|c| {
            format!(
                "{} (+{} -{})",
                c.path.as_deref().unwrap_or("/dev/null"),
                c.added,
                c.removed
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct FileChange {
    path: Option<String>,
    added: usize,
    removed: usize,
}

/// Lines left in the current hunk; `None` when the `@@` header carried no counts.
struct Hunk {
    remaining: Option<(usize, usize)>,
}

impl Hunk {
    fn parse(header: &str) -> Self {
        let mut old = None;
        let mut new = None;
        for token in header.trim_start_matches('@').split_whitespace() {
            if let Some(range) = token.strip_prefix('-') {
                old = range_len(range);
            } else if let Some(range) = token.strip_prefix('+') {
                new = range_len(range);
            }
        }
        Self {
            remaining: old.zip(new),
        }
    }

    fn is_done(&self) -> bool {
        self.remaining == Some((0, 0))
    }

    fn consume(&mut self, old: bool, new: bool) {
        if let Some((o, n)) = self.remaining.as_mut() {
            if old {
                *o = o.saturating_sub(1);
            }
            if new {
                *n = n.saturating_sub(1);
            }
        }
    }
}

fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((_, len)) => len.parse().ok(),
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

/// Walk file headers and hunk bodies. Headers are only recognised outside a hunk; inside a
/// hunk without counts, `--- ` is a header only when a `+++ ` line follows it.
fn file_changes(diff: &str) -> Vec<FileChange> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut changes: Vec<FileChange> = Vec::new();
    let mut pending_old: Option<String> = None;
    let mut hunk: Option<Hunk> = None;

    for (idx, line) in lines.iter().enumerate() {
        let body_line = line.is_empty() || line.starts_with([' ', '+', '-', '\\']);
        if hunk.as_ref().is_some_and(Hunk::is_done) || !body_line {
            hunk = None;
        }
        let open_ended = hunk.as_ref().is_some_and(|h| h.remaining.is_none());
        if hunk.is_none() || open_ended {
            if line.starts_with("diff --git") {
                hunk = None;
                continue;
            }
            if let Some(old) = line.strip_prefix("--- ") {
                let next_is_new = lines.get(idx + 1).is_some_and(|n| n.starts_with("+++ "));
                if hunk.is_none() || next_is_new {
                    hunk = None;
                    pending_old = strip_side_prefix(old, "a/");
                    continue;
                }
            }
        }
        if hunk.is_none() {
            if let Some(new) = line.strip_prefix("+++ ") {
                changes.push(FileChange {
                    path: strip_side_prefix(new, "b/").or_else(|| pending_old.take()),
                    added: 0,
                    removed: 0,
                });
                pending_old = None;
                continue;
            }
        }
        if line.starts_with("@@") {
            hunk = Some(Hunk::parse(line));
            continue;
        }
        let (Some(current), Some(h)) = (changes.last_mut(), hunk.as_mut()) else {
            continue;
        };
        if line.starts_with('+') {
            current.added += 1;
            h.consume(false, true);
        } else if line.starts_with('-') {
            current.removed += 1;
            h.consume(true, false);
        } else if !line.starts_with('\\') {
            h.consume(true, true);
        }
    }
    changes
}

fn strip_side_prefix(raw: &str, prefix: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(path).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "diff --git a/src/lib.rs b/src/lib.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n-fn a() {}\n+fn a() { todo() }\n+fn b() {}\ndiff --git a/old.txt b/old.txt\n--- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\n";

    #[test]
    fn diff_prefixes_are_recognized() {
        assert!(is_unified_diff("diff --git a/x b/x"));
        assert!(is_unified_diff("  --- a/x\n+++ b/x"));
        assert!(!is_unified_diff("Here is the patch:\n--- a/x"));
        assert!(!is_unified_diff("NO_CHANGES"));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```diff\n--- a/x\n```"), "--- a/x");
        assert_eq!(
            strip_code_fence("```\n{\"tool\":\"show_diff\"}\n```"),
            "{\"tool\":\"show_diff\"}"
        );
        assert_eq!(strip_code_fence("  NO_CHANGES \n"), "NO_CHANGES");
    }

    #[test]
    fn changed_files_handles_deletions() {
        assert_eq!(changed_files(SAMPLE), vec!["src/lib.rs", "old.txt"]);
    }

    #[test]
    fn summary_counts_lines_per_file() {
        let summary = summarize_diff(SAMPLE);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "src/lib.rs (+2 -1)");
        assert_eq!(lines[1], "old.txt (+0 -1)");
    }

    #[test]
    fn removed_sql_comment_is_not_a_file_header() {
        let diff = "--- a/db/schema.sql\n+++ b/db/schema.sql\n@@ -1,3 +1,2 @@\n--- legacy table\n CREATE TABLE t (id int);\n--- drop later\n";
        assert_eq!(changed_files(diff), vec!["db/schema.sql"]);
        assert_eq!(summarize_diff(diff), "db/schema.sql (+0 -2)");
    }

    #[test]
    fn hunks_without_counts_still_find_the_next_file() {
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@\n--- old note\n++-- new note\n--- a/r.sql\n+++ b/r.sql\n@@\n+select 1;\n";
        assert_eq!(changed_files(diff), vec!["q.sql", "r.sql"]);
        assert_eq!(summarize_diff(diff), "q.sql (+1 -1)\nr.sql (+1 -0)");
    }
}
