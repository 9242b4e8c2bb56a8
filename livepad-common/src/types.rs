//! Identifiers and enums shared by the host and the workers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Languages with a worker implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::JavaScript, Language::TypeScript, Language::Python];

    /// Canonical lowercase name, also used as the config table key
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
        }
    }

    /// Strict languages surface transpile failures instead of degrading.
    pub fn is_strict(&self) -> bool {
        matches!(self, Language::TypeScript)
    }

    /// Whether the source belongs to the C-like (brace) family.
    pub fn is_brace_family(&self) -> bool {
        matches!(self, Language::JavaScript | Language::TypeScript)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "mjs" | "cjs" | "jsx" => Some(Language::JavaScript),
            "ts" | "mts" | "cts" | "tsx" => Some(Language::TypeScript),
            "py" => Some(Language::Python),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown language '{0}' (expected javascript, typescript or python)")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "python" | "py" | "python3" => Ok(Language::Python),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Console channel a worker captured output from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl fmt::Display for ConsoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleType::Log => "log",
            ConsoleType::Info => "info",
            ConsoleType::Warn => "warn",
            ConsoleType::Error => "error",
            ConsoleType::Debug => "debug",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("ts".parse::<Language>().unwrap(), Language::TypeScript);
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert!("ruby".parse::<Language>().is_err());
        assert_eq!(Language::from_extension("mjs"), Some(Language::JavaScript));
        assert_eq!(Language::from_extension("rs"), None);
    }

    #[test]
    fn test_only_typescript_is_strict() {
        assert!(Language::TypeScript.is_strict());
        assert!(!Language::JavaScript.is_strict());
        assert!(!Language::Python.is_strict());
    }
}
