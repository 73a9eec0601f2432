//! Extraction of failing test names and files from raw test-runner output.

use std::sync::LazyLock;

use regex::Regex;

/// Failures recognised in one test run. Both lists are de-duplicated, first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFailures {
    pub tests: Vec<String>,
    pub files: Vec<String>,
}

impl TestFailures {
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.files.is_empty()
    }
}

static TEST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // cargo test
        r"(?m)^test (\S+) \.\.\. FAILED",
        // pytest short summary
        r"(?m)^FAILED \S+::(\S+)",
        // go test
        r"(?m)^\s*--- FAIL: (\S+)",
        // jest / vitest
        r"(?m)^\s*(?:✕|×) (.+?)(?: \(\d+ ?m?s\))?$",
        // dotnet test
        r"(?m)^\s*Failed (\S+) \[",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("failure pattern should compile"))
    .collect()
});

static FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // jest / vitest suite header
        r"(?m)^\s*FAIL (\S+\.\w+)",
        // pytest short summary
        r"(?m)^FAILED (\S+\.py)::",
        // rust panic location
        r"panicked at (\S+\.rs):\d+",
        // generic `path/to/file.ext:line`
        r"(?m)(?:^|\s)((?:[\w.-]+/)+[\w.-]+\.(?:rs|py|ts|tsx|js|jsx|go|cs|java|kt)):\d+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("failure pattern should compile"))
    .collect()
});

pub fn extract_failures(output: &str) -> TestFailures {
    TestFailures {
        tests: collect_matches(&TEST_PATTERNS, output),
        files: collect_matches(&FILE_PATTERNS, output),
    }
}

fn collect_matches(patterns: &[Regex], output: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(output) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().trim().to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    let mut out: Vec<String> = Vec::new();
    for (_, value) in found {
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_cargo_failures() {
        let output = "running 3 tests\ntest parser::tests::ok ... ok\ntest parser::tests::bad ... FAILED\ntest io::tests::slow ... FAILED\n\nthread 'parser::tests::bad' panicked at src/parser.rs:42:9:\nassertion failed\n";
        let failures = extract_failures(output);
        assert_eq!(failures.tests, vec!["parser::tests::bad", "io::tests::slow"]);
        assert_eq!(failures.files, vec!["src/parser.rs"]);
    }

    #[test]
    fn extracts_pytest_and_jest_failures() {
        let output = "FAILED tests/test_api.py::test_login - AssertionError\n FAIL src/app.test.ts\n  ✕ renders header (12 ms)\n";
        let failures = extract_failures(output);
        assert_eq!(failures.tests, vec!["test_login", "renders header"]);
        assert_eq!(failures.files, vec!["tests/test_api.py", "src/app.test.ts"]);
    }

    #[test]
    fn extracts_go_failures_and_dedups() {
        let output = "--- FAIL: TestServe (0.00s)\n    server_test.go:10: boom\n--- FAIL: TestServe (0.00s)\n";
        let failures = extract_failures(output);
        assert_eq!(failures.tests, vec!["TestServe"]);
    }

    #[test]
    fn clean_output_has_no_failures() {
        assert!(extract_failures("test result: ok. 10 passed; 0 failed").is_empty());
    }
}
