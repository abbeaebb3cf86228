//! Adapter catalog: launch templates and prompt patterns per agent type
//!
//! A catalog entry is plain data. It can come from the built-in table, an
//! external TOML/JSON file or inline `[adapters.<name>]` config sections;
//! later sources override earlier ones by name.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

use crate::adapter::ExecutionMode;
use crate::{Error, Result};

/// Placeholder substituted with the task prompt in `headless_args`
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// One named prompt-detection expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub regex: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Catalog entry for one adapter type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Executable, optionally followed by arguments (shell-style quoting)
    pub command: String,

    /// Base arguments for every launch
    #[serde(default)]
    pub args: Vec<String>,

    /// Headless argument template; `{prompt}` is replaced with the prompt
    #[serde(default)]
    pub headless_args: Vec<String>,

    /// Arguments added to interactive launches when auto-approval is on
    #[serde(default)]
    pub auto_args: Vec<String>,

    /// Ordered prompt-detection patterns
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,

    /// Supported modes; empty means all
    #[serde(default)]
    pub modes: Vec<ExecutionMode>,

    /// Free-form metadata shown by `cadence adapters`
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AdapterSpec {
    pub fn supports(&self, mode: ExecutionMode) -> bool {
        self.modes.is_empty() || self.modes.contains(&mode)
    }
}

/// A pattern ready for matching
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub description: Option<String>,
    pub source: String,
    pub regex: Regex,
}

impl CompiledPattern {
    /// Compile a single pattern (case-insensitive unless requested otherwise)
    pub fn compile(adapter: &str, spec: &PatternSpec) -> Result<Self> {
        let regex = RegexBuilder::new(&spec.regex)
            .case_insensitive(!spec.case_sensitive)
            .multi_line(true)
            .build()
            .map_err(|e| Error::PatternLoad {
                adapter: adapter.to_string(),
                name: spec.name.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            source: spec.regex.clone(),
            regex,
        })
    }
}

/// Compile an adapter's patterns, skipping the invalid ones.
///
/// Returns the usable patterns in order plus one `PatternLoad` error per
/// skipped entry.
pub fn compile_patterns(adapter: &str, specs: &[PatternSpec]) -> (Vec<CompiledPattern>, Vec<Error>) {
    let mut compiled = Vec::with_capacity(specs.len());
    let mut errors = Vec::new();

    for spec in specs {
        match CompiledPattern::compile(adapter, spec) {
            Ok(pattern) => compiled.push(pattern),
            Err(e) => {
                warn!("Skipping invalid pattern: {}", e);
                errors.push(e);
            }
        }
    }

    (compiled, errors)
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    adapters: HashMap<String, AdapterSpec>,
}

/// Named collection of adapter specs
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, AdapterSpec>,
}

impl Catalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in agent entries
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert("claude", claude_spec());
        catalog.insert("codex", codex_spec());
        catalog.insert("gemini", gemini_spec());
        catalog.insert("shell", shell_spec());
        catalog
    }

    /// Load entries from a TOML or JSON file (`[adapters.<name>]` tables)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: CatalogFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        let mut catalog = Self::new();
        catalog.extend(file.adapters);
        Ok(catalog)
    }

    /// Insert or replace one entry
    pub fn insert(&mut self, name: impl Into<String>, spec: AdapterSpec) {
        self.entries.insert(name.into(), spec);
    }

    /// Merge entries, replacing existing ones with the same name
    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, AdapterSpec)>) {
        self.entries.extend(entries);
    }

    /// Merge another catalog on top of this one
    pub fn merge(&mut self, other: Catalog) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, name: &str) -> Option<&AdapterSpec> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdapterSpec)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn pattern(name: &str, description: &str, regex: &str) -> PatternSpec {
    PatternSpec {
        name: name.to_string(),
        description: Some(description.to_string()),
        regex: regex.to_string(),
        case_sensitive: false,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn claude_spec() -> AdapterSpec {
    AdapterSpec {
        command: "claude".to_string(),
        headless_args: strings(&["-p", PROMPT_PLACEHOLDER]),
        auto_args: strings(&["--dangerously-skip-permissions"]),
        patterns: vec![
            pattern(
                "interaction_permission",
                "Tool permission request",
                r"do you want to (?:proceed|make this edit|create)|wants? to use \w+|allow\?",
            ),
            pattern("interaction_confirm", "Yes/no confirmation", r"\[y/n\]|\(y/n\)"),
            pattern("ready", "Input box is idle", r"^>\s*$"),
        ],
        metadata: BTreeMap::from([("vendor".to_string(), "anthropic".to_string())]),
        ..Default::default()
    }
}

fn codex_spec() -> AdapterSpec {
    AdapterSpec {
        command: "codex".to_string(),
        headless_args: strings(&["exec", PROMPT_PLACEHOLDER]),
        auto_args: strings(&["--full-auto"]),
        patterns: vec![
            pattern(
                "interaction_approval",
                "Command or patch approval",
                r"(?:proceed|approve|accept)\?\s*\[y",
            ),
            pattern("interaction_allow", "Allow command menu", r"allow (?:once|command)"),
        ],
        metadata: BTreeMap::from([("vendor".to_string(), "openai".to_string())]),
        ..Default::default()
    }
}

fn gemini_spec() -> AdapterSpec {
    AdapterSpec {
        command: "gemini".to_string(),
        headless_args: strings(&["-p", PROMPT_PLACEHOLDER]),
        auto_args: strings(&["--yolo"]),
        patterns: vec![
            pattern(
                "interaction_confirm",
                "Tool call confirmation",
                r"apply this change\?|allow execution|\[y/n\]",
            ),
        ],
        metadata: BTreeMap::from([("vendor".to_string(), "google".to_string())]),
        ..Default::default()
    }
}

fn shell_spec() -> AdapterSpec {
    AdapterSpec {
        command: "sh".to_string(),
        headless_args: strings(&["-c", PROMPT_PLACEHOLDER]),
        patterns: vec![pattern(
            "interaction_confirm",
            "Yes/no confirmation",
            r"\[y/n\]|\(y/n\)",
        )],
        modes: vec![ExecutionMode::Headless, ExecutionMode::Interactive],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_entries() {
        let catalog = Catalog::builtin();
        for name in ["claude", "codex", "gemini", "shell"] {
            let spec = catalog.get(name).unwrap();
            let (_, errors) = compile_patterns(name, &spec.patterns);
            assert!(errors.is_empty(), "{} has invalid patterns", name);
        }
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let specs = vec![
            pattern("broken", "", "[invalid"),
            pattern("interaction_confirm", "", r"\[y/n\]"),
        ];
        let (compiled, errors) = compile_patterns("test", &specs);

        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].name, "interaction_confirm");
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::PatternLoad { name, .. } if name == "broken"));
    }

    #[test]
    fn test_patterns_are_case_insensitive_by_default() {
        let spec = pattern("approve", "", r"approve\? \[y/n\]");
        let compiled = CompiledPattern::compile("test", &spec).unwrap();
        assert!(compiled.regex.is_match("Approve? [y/N]"));

        let strict = PatternSpec {
            case_sensitive: true,
            ..spec
        };
        let compiled = CompiledPattern::compile("test", &strict).unwrap();
        assert!(!compiled.regex.is_match("Approve? [y/N]"));
    }

    #[test]
    fn test_load_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("catalog.toml");
        std::fs::write(
            &toml_path,
            r#"
[adapters.aider]
command = "aider --no-git"
modes = ["interactive"]

[[adapters.aider.patterns]]
name = "interaction_confirm"
regex = '\(Y\)es/\(N\)o'
"#,
        )
        .unwrap();
        let catalog = Catalog::load(&toml_path).unwrap();
        let aider = catalog.get("aider").unwrap();
        assert_eq!(aider.command, "aider --no-git");
        assert!(aider.supports(ExecutionMode::Interactive));
        assert!(!aider.supports(ExecutionMode::Headless));
        assert_eq!(aider.patterns.len(), 1);

        let json_path = dir.path().join("catalog.json");
        std::fs::write(
            &json_path,
            r#"{"adapters": {"echo": {"command": "echo", "headless_args": ["{prompt}"]}}}"#,
        )
        .unwrap();
        let catalog = Catalog::load(&json_path).unwrap();
        assert_eq!(catalog.get("echo").unwrap().headless_args, vec!["{prompt}"]);
    }

    #[test]
    fn test_merge_overrides_by_name() {
        let mut catalog = Catalog::builtin();
        let mut overrides = Catalog::new();
        overrides.insert(
            "claude",
            AdapterSpec {
                command: "/opt/claude/bin/claude".to_string(),
                ..Default::default()
            },
        );
        catalog.merge(overrides);

        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.get("claude").unwrap().command, "/opt/claude/bin/claude");
    }
}
