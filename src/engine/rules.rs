//! Rule-based commit messages.
//!
//! No model involved: the touched files and the added/removed line balance
//! decide the message. Fast enough to run on every commit.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Engine, GenerationError};

static DIFF_GIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^diff --git a/(.*?) b/").expect("diff header regex"));

/// Source extensions preferred when naming the primary file.
const PRIORITY_EXTENSIONS: &[&str] = &[
    ".rs", ".py", ".js", ".ts", ".jsx", ".tsx", ".go", ".java", ".cpp", ".c",
];

/// File-name keywords per change kind, checked in order.
const FILE_KEYWORDS: &[(ChangeKind, &[&str])] = &[
    (
        ChangeKind::Config,
        &[".json", "config", "settings", ".env", "dockerfile", "makefile"],
    ),
    (
        ChangeKind::Test,
        &["test", "spec", "__test__", ".test.", "_test."],
    ),
    (
        ChangeKind::Docs,
        &["readme", "doc", "docs", ".md", "changelog"],
    ),
    (ChangeKind::Fix, &["fix", "bug", "error", "issue"]),
    (ChangeKind::Feat, &["add", "new", "create", "implement"]),
    (
        ChangeKind::Refactor,
        &["refactor", "cleanup", "organize", "restructure"],
    ),
    (ChangeKind::Style, &["format", "lint", "style", "prettier"]),
    (
        ChangeKind::Deps,
        &["package.json", "requirements.txt", "cargo.lock", "pip", "npm"],
    ),
];

const FIX_WORDS: &[&str] = &["fix", "bug", "error", "issue"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Config,
    Test,
    Docs,
    Fix,
    Feat,
    Refactor,
    Style,
    Deps,
    Remove,
    Update,
}

/// What the rules look at in a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub files: Vec<String>,
    pub added: usize,
    pub removed: usize,
}

impl DiffSummary {
    pub fn parse(diff: &str) -> Self {
        let mut summary = Self::default();
        for line in diff.lines() {
            if let Some(caps) = DIFF_GIT_RE.captures(line) {
                let file = caps[1].to_string();
                if !summary.files.contains(&file) {
                    summary.files.push(file);
                }
            } else if line.starts_with('+') && !line.starts_with("+++") {
                summary.added += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                summary.removed += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(diff: &str, summary: &DiffSummary) -> ChangeKind {
        let files = summary.files.join(" ").to_lowercase();
        for (kind, keywords) in FILE_KEYWORDS {
            if keywords.iter().any(|k| files.contains(k)) {
                return *kind;
            }
        }

        let diff_lower = diff.to_lowercase();
        if FIX_WORDS.iter().any(|w| diff_lower.contains(w)) {
            return ChangeKind::Fix;
        }

        if summary.added > summary.removed * 2 {
            ChangeKind::Feat
        } else if summary.removed > summary.added * 2 {
            ChangeKind::Remove
        } else {
            ChangeKind::Update
        }
    }

    pub fn message_for(diff: &str) -> String {
        let summary = DiffSummary::parse(diff);
        let kind = Self::classify(diff, &summary);
        let count = summary.files.len();
        let primary = primary_file(&summary.files);

        match kind {
            ChangeKind::Test if count == 1 => {
                format!(
                    "Add tests for {}",
                    primary.replace(".test", "").replace("_test", "")
                )
            }
            ChangeKind::Test => format!("Add tests for {count} modules"),
            ChangeKind::Config => "Update configuration".to_string(),
            ChangeKind::Docs => "Update documentation".to_string(),
            ChangeKind::Fix if count == 1 => format!("Fix issue in {primary}"),
            ChangeKind::Fix => "Fix multiple issues".to_string(),
            ChangeKind::Feat if count == 1 => format!("Add feature to {primary}"),
            ChangeKind::Feat => format!("Add new features ({count} files)"),
            ChangeKind::Refactor if count == 1 => format!("Refactor {primary}"),
            ChangeKind::Refactor => format!("Refactor codebase ({count} files)"),
            ChangeKind::Style => "Format code".to_string(),
            ChangeKind::Deps => "Update dependencies".to_string(),
            ChangeKind::Remove if count == 1 => format!("Remove code from {primary}"),
            ChangeKind::Remove if count > 1 => format!("Remove code from {count} files"),
            ChangeKind::Remove | ChangeKind::Update => match count {
                0 => "Update files".to_string(),
                1 => format!("Update {primary}"),
                2 => format!("Update {}", summary.files.join(", ")),
                3 => format!("Update {}...", summary.files[..2].join(", ")),
                _ => format!("Update {count} files"),
            },
        }
    }
}

fn primary_file(files: &[String]) -> &str {
    PRIORITY_EXTENSIONS
        .iter()
        .find_map(|ext| files.iter().find(|f| f.ends_with(ext)))
        .or_else(|| files.first())
        .map_or("files", String::as_str)
}

impl Engine for RuleEngine {
    fn id(&self) -> &str {
        "rules"
    }

    fn generate(&self, diff: &str) -> Result<String, GenerationError> {
        Ok(Self::message_for(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_diff(path: &str, added: usize, removed: usize) -> String {
        let mut diff = format!("diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n");
        for i in 0..added {
            diff.push_str(&format!("+added line {i}\n"));
        }
        for i in 0..removed {
            diff.push_str(&format!("-removed line {i}\n"));
        }
        diff
    }

    #[test]
    fn summary_counts_lines_and_files() {
        let diff = format!("{}{}", file_diff("src/a.rs", 3, 1), file_diff("src/b.rs", 0, 2));
        let summary = DiffSummary::parse(&diff);
        assert_eq!(summary.files, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(summary.added, 3);
        assert_eq!(summary.removed, 3);
    }

    #[test]
    fn config_files_win_over_content() {
        let diff = file_diff("settings.json", 1, 1);
        assert_eq!(RuleEngine::message_for(&diff), "Update configuration");
    }

    #[test]
    fn single_test_file_names_the_module() {
        let diff = file_diff("src/parser_test.go", 10, 0);
        assert_eq!(
            RuleEngine::message_for(&diff),
            "Add tests for src/parser.go"
        );
    }

    #[test]
    fn docs_change() {
        let diff = file_diff("README.md", 4, 2);
        assert_eq!(RuleEngine::message_for(&diff), "Update documentation");
    }

    #[test]
    fn fix_detected_from_content() {
        let mut diff = file_diff("src/lib.rs", 1, 1);
        diff.push_str("+// fix off-by-one\n");
        assert_eq!(RuleEngine::message_for(&diff), "Fix issue in src/lib.rs");
    }

    #[test]
    fn mostly_additions_is_a_feature() {
        let diff = format!("{}{}", file_diff("src/a.rs", 10, 0), file_diff("lib/b.rb", 5, 1));
        assert_eq!(
            RuleEngine::message_for(&diff),
            "Add new features (2 files)"
        );
    }

    #[test]
    fn mostly_removals() {
        let diff = file_diff("src/old.rs", 0, 12);
        assert_eq!(RuleEngine::message_for(&diff), "Remove code from src/old.rs");
    }

    #[test]
    fn balanced_change_lists_files() {
        let one = file_diff("src/a.rs", 2, 2);
        assert_eq!(RuleEngine::message_for(&one), "Update src/a.rs");

        let two = format!("{}{}", one, file_diff("src/b.rs", 1, 1));
        assert_eq!(RuleEngine::message_for(&two), "Update src/a.rs, src/b.rs");

        let three = format!("{}{}", two, file_diff("src/c.rs", 1, 1));
        assert_eq!(
            RuleEngine::message_for(&three),
            "Update src/a.rs, src/b.rs..."
        );

        let four = format!("{}{}", three, file_diff("src/d.rs", 1, 1));
        assert_eq!(RuleEngine::message_for(&four), "Update 4 files");
    }

    #[test]
    fn empty_diff_still_produces_a_message() {
        assert_eq!(RuleEngine::message_for(""), "Update files");
    }

    #[test]
    fn primary_file_prefers_source_extensions() {
        let files = vec!["assets/logo.svg".to_string(), "src/main.rs".to_string()];
        assert_eq!(primary_file(&files), "src/main.rs");
        assert_eq!(primary_file(&files[..1]), "assets/logo.svg");
        assert_eq!(primary_file(&[]), "files");
    }

    #[test]
    fn engine_is_deterministic() {
        let engine = RuleEngine::new();
        let diff = file_diff("src/a.rs", 2, 2);
        assert_eq!(
            engine.generate(&diff).unwrap(),
            engine.generate(&diff).unwrap()
        );
    }
}
