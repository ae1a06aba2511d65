//! Content-based language detection for submitted code
//!
//! Deterministic weighted vote over two pattern families: shell-command
//! first tokens and pipe/redirect/conjunction operators versus
//! import/def/colon-block/decorator patterns. Single-line input
//! short-circuits on the shell-command first token. Ties fall to Python.

use regex::Regex;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Shell,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Shell => "shell",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

/// First tokens that identify a shell command line.
const SHELL_COMMANDS: &[&str] = &[
    "ls", "cd", "pwd", "cat", "grep", "find", "echo", "mkdir", "rm", "cp", "mv", "touch",
    "chmod", "chown", "curl", "wget", "git", "tar", "head", "tail", "wc", "sort", "uniq",
    "sed", "awk", "ps", "kill", "df", "du", "date", "env", "export", "which", "xargs",
    "make", "docker", "ssh", "rsync", "tee", "cut", "tr", "basename", "dirname",
];

/// Compiled pattern families. Built once per process.
pub struct Detector {
    python_line: Vec<Regex>,
    shell_line: Vec<Regex>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("static detection pattern"))
                .collect()
        };
        Self {
            python_line: compile(&[
                r"^\s*import\s+\w",
                r"^\s*from\s+[\w.]+\s+import\s",
                r"^\s*def\s+\w+\s*\(",
                r"^\s*class\s+\w+",
                r"^\s*(if|elif|else|for|while|try|except|finally|with)\b.*:\s*(#.*)?$",
                r"^\s*@\w+",
                r"^\s*return\b",
                r"\bprint\s*\(",
                r#"\bf["']"#,
                r#"^\s*\w+\s*=\s*[\[{(\w'"]"#,
            ]),
            shell_line: compile(&[
                r"\|\s*\w",
                r"&&|\|\|",
                r"(^|\s)>{1,2}\s*\S",
                r"2>&1|2>\s*\S",
                r"\$\(|\$\{|`",
                r"^\s*\w+=\S+\s+\w", // VAR=x cmd
                r"(^|\s)-{1,2}[a-zA-Z]", // flag arguments
            ]),
        }
    }

    /// Classify a submission. Deterministic for a given input.
    pub fn detect(&self, code: &str) -> Language {
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Language::Python;
        }

        // Shebangs settle it outright.
        if let Some(first) = trimmed.lines().next() {
            if first.starts_with("#!") {
                return if first.contains("python") {
                    Language::Python
                } else {
                    Language::Shell
                };
            }
        }

        let lines: Vec<&str> = trimmed
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        // Single-line input: the shell-command first token short-circuits.
        if lines.len() == 1 {
            if starts_with_shell_command(lines[0]) {
                return Language::Shell;
            }
        }

        let mut python_votes = 0i32;
        let mut shell_votes = 0i32;
        for line in &lines {
            if starts_with_shell_command(line) {
                shell_votes += 2;
            }
            for pattern in &self.shell_line {
                if pattern.is_match(line) {
                    shell_votes += 1;
                }
            }
            for pattern in &self.python_line {
                if pattern.is_match(line) {
                    python_votes += 2;
                }
            }
        }

        if shell_votes > python_votes {
            Language::Shell
        } else {
            Language::Python
        }
    }
}

fn starts_with_shell_command(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|token| SHELL_COMMANDS.contains(&token))
        .unwrap_or(false)
}
