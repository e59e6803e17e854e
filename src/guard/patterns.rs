//! Injection-pattern scanning for untrusted input.
//!
//! Pattern tables are compiled once at scanner construction. Scanning
//! is case-insensitive and returns the first matching category, so
//! callers get a single stable rejection reason for a given input.

use regex::Regex;

/// Category of hostile input a scanner rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionCategory {
    /// SQL injection fragments (tautologies, stacked statements).
    Sql,
    /// Script/markup injection (XSS vectors).
    Script,
    /// Filesystem path traversal sequences.
    PathTraversal,
    /// Shell command injection metacharacters.
    Command,
}

impl InjectionCategory {
    /// Caller-facing rejection message. Deliberately generic; the
    /// matched fragment is only ever logged internally.
    pub fn message(&self) -> &'static str {
        match self {
            InjectionCategory::Sql => "Potential SQL injection detected",
            InjectionCategory::Script => "Potential script injection detected",
            InjectionCategory::PathTraversal => "Potential path traversal detected",
            InjectionCategory::Command => "Potential command injection detected",
        }
    }
}

/// Compiled injection-pattern table.
#[derive(Debug, Clone)]
pub struct InjectionScanner {
    rules: Vec<(InjectionCategory, Vec<Regex>)>,
}

impl InjectionScanner {
    /// Compile the default rule set.
    pub fn new() -> Self {
        Self {
            rules: vec![
                (InjectionCategory::Sql, compile(SQL_PATTERNS)),
                (InjectionCategory::Script, compile(SCRIPT_PATTERNS)),
                (InjectionCategory::PathTraversal, compile(TRAVERSAL_PATTERNS)),
                (InjectionCategory::Command, compile(COMMAND_PATTERNS)),
            ],
        }
    }

    /// Scan all categories, returning the first match.
    pub fn scan(&self, text: &str) -> Option<InjectionCategory> {
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(text)))
            .map(|(category, _)| *category)
    }

    /// Scan a single category.
    pub fn matches(&self, category: InjectionCategory, text: &str) -> bool {
        self.rules
            .iter()
            .filter(|(c, _)| *c == category)
            .any(|(_, patterns)| patterns.iter().any(|p| p.is_match(text)))
    }
}

impl Default for InjectionScanner {
    fn default() -> Self {
        Self::new()
    }
}

const SQL_PATTERNS: &[&str] = &[
    r"(?i)('|%27)\s*(or|and)\b",
    r"(?i)\b(or|and)\s+\d+\s*=\s*\d+",
    r"(?i)\bunion\s+(all\s+)?select\b",
    r"(?i);\s*(drop|delete|insert|update|truncate|alter)\b",
    r"(?i)\b(exec|execute)\s*\(",
    r"--\s*$",
    r"(?i)'\s*;\s*",
];

const SCRIPT_PATTERNS: &[&str] = &[
    r"(?i)<\s*script\b",
    r"(?i)<\s*/\s*script\s*>",
    r"(?i)javascript\s*:",
    r"(?i)\bon(load|error|click|mouseover|focus|submit)\s*=",
    r"(?i)<\s*(iframe|object|embed)\b",
    r"(?i)data\s*:\s*text/html",
];

const TRAVERSAL_PATTERNS: &[&str] = &[
    r"\.\./",
    r"\.\.\\",
    r"(?i)%2e%2e(%2f|%5c|/|\\)",
    r"(?i)\.\.(%2f|%5c)",
];

const COMMAND_PATTERNS: &[&str] = &[
    r"[;&|]\s*(cat|ls|rm|mv|cp|wget|curl|nc|sh|bash|zsh|python|perl|powershell)\b",
    r"\$\(",
    r"`[^`]*`",
    r"(?i)\|\s*(sh|bash)\b",
    r"&&|\|\|",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
