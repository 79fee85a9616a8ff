use std::path::Path;

use glob::{MatchOptions, Pattern};
use stacked_errors::{Result, StackableErr};

/// Ignore files looked for in a context root, first one found wins
pub const IGNORE_FILE_NAMES: [&str; 2] = [".containerignore", ".dockerignore"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    exception: bool,
}

/// Exclusion rules in the `.containerignore` format.
///
/// Patterns match slash separated paths relative to the context root, and a
/// pattern matching a directory also matches everything beneath it. A leading
/// `!` re-includes what earlier patterns excluded, the last matching pattern
/// decides.
#[derive(Debug, Clone, Default)]
pub struct ExcludePatterns {
    rules: Vec<Rule>,
    keep: Vec<String>,
}

fn normalize(pattern: &str) -> &str {
    let mut pattern = pattern.trim();
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest;
    }
    pattern.trim_start_matches('/').trim_end_matches('/')
}

impl ExcludePatterns {
    /// Parses ignore file contents, skipping blank lines and `#` comments
    pub fn parse(contents: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue
            }
            let (exception, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, normalize(rest)),
                None => (false, normalize(line)),
            };
            if pattern.is_empty() {
                continue
            }
            let pattern = Pattern::new(pattern)
                .stack_err_with(|| format!("invalid exclude pattern \"{line}\""))?;
            rules.push(Rule { pattern, exception });
        }
        Ok(Self {
            rules,
            keep: Vec::new(),
        })
    }

    /// Loads the ignore file of `root`, no ignore file means no rules
    pub async fn load(root: &Path) -> Result<Self> {
        for name in IGNORE_FILE_NAMES {
            let path = root.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    tracing::debug!("using exclude patterns from {path:?}");
                    return Self::parse(&contents)
                        .stack_err_with(|| format!("ExcludePatterns::load -> {path:?}"))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => {
                    return Err(e).stack_err_with(|| format!("ExcludePatterns::load -> {path:?}"))
                }
            }
        }
        Ok(Self::default())
    }

    /// Never exclude `path`, regardless of the rules
    pub fn keep(mut self, path: impl Into<String>) -> Self {
        self.keep.push(path.into());
        self
    }

    /// If a kept path lies beneath the directory `rel_dir`
    pub fn keeps_beneath(&self, rel_dir: &str) -> bool {
        self.keep.iter().any(|k| {
            k.strip_prefix(rel_dir)
                .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// If any rule is a `!` exception
    pub fn has_exceptions(&self) -> bool {
        self.rules.iter().any(|rule| rule.exception)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `rel_path` is slash separated and relative to the context root
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        if self.keep.iter().any(|k| k == rel_path) {
            return false
        }
        let mut excluded = false;
        for rule in &self.rules {
            if rule.exception == excluded && matches_self_or_parent(&rule.pattern, rel_path) {
                excluded = !rule.exception;
            }
        }
        excluded
    }
}

fn matches_self_or_parent(pattern: &Pattern, rel_path: &str) -> bool {
    if pattern.matches_with(rel_path, MATCH_OPTIONS) {
        return true
    }
    rel_path
        .match_indices('/')
        .any(|(i, _)| pattern.matches_with(&rel_path[..i], MATCH_OPTIONS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules() {
        let excludes = ExcludePatterns::parse(
            "# build output\n\n/target/\n*.md\n!README.md\n./secrets\nsrc/**/*.tmp\n",
        )
        .unwrap();
        assert!(excludes.has_exceptions());
        assert!(excludes.is_excluded("target"));
        assert!(excludes.is_excluded("target/debug/app"));
        assert!(excludes.is_excluded("CHANGELOG.md"));
        assert!(!excludes.is_excluded("README.md"));
        // `*` does not cross directories
        assert!(!excludes.is_excluded("docs/guide.md"));
        assert!(excludes.is_excluded("secrets/key"));
        assert!(excludes.is_excluded("src/a/b/c.tmp"));
        assert!(!excludes.is_excluded("src/main.rs"));
        assert!(!excludes.is_excluded("targets"));
    }

    #[test]
    fn last_match_wins() {
        let excludes = ExcludePatterns::parse("!a.txt\n*.txt\n").unwrap();
        assert!(excludes.is_excluded("a.txt"));
        let excludes = ExcludePatterns::parse("*.txt\n!a.txt\n").unwrap();
        assert!(!excludes.is_excluded("a.txt"));
        assert!(excludes.is_excluded("b.txt"));
    }

    #[test]
    fn kept_paths() {
        let excludes = ExcludePatterns::parse("*\n")
            .unwrap()
            .keep("Containerfile");
        assert!(!excludes.is_excluded("Containerfile"));
        assert!(excludes.is_excluded("other"));

        let excludes = ExcludePatterns::parse("docker\n")
            .unwrap()
            .keep("docker/Containerfile");
        assert!(excludes.keeps_beneath("docker"));
        assert!(!excludes.keeps_beneath("dock"));
        assert!(!excludes.keeps_beneath("docker/Containerfile"));
        assert!(!excludes.is_excluded("docker/Containerfile"));
        assert!(excludes.is_excluded("docker/other"));
    }

    #[tokio::test]
    async fn load_prefers_containerignore() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExcludePatterns::load(dir.path()).await.unwrap().is_empty());

        tokio::fs::write(dir.path().join(".dockerignore"), "b\n")
            .await
            .unwrap();
        let excludes = ExcludePatterns::load(dir.path()).await.unwrap();
        assert!(excludes.is_excluded("b"));

        tokio::fs::write(dir.path().join(".containerignore"), "a\n")
            .await
            .unwrap();
        let excludes = ExcludePatterns::load(dir.path()).await.unwrap();
        assert!(excludes.is_excluded("a"));
        assert!(!excludes.is_excluded("b"));
    }
}
