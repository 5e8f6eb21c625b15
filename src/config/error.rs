//! Config error types for memdoc.
//!
//! Rendered cargo-style so the CLI can print them verbatim.

use std::fmt;
use std::path::PathBuf;

/// Error loading or saving the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON parse error. The file is left untouched.
    Parse {
        path: PathBuf,
        message: String,
        line: usize,
        column: usize,
    },

    /// No home directory to derive the config location from.
    NoHome,
}

impl ConfigError {
    pub(crate) fn from_json(path: PathBuf, err: serde_json::Error) -> Self {
        ConfigError::Parse {
            path,
            message: err.to_string(),
            line: err.line(),
            column: err.column(),
        }
    }

    /// Format error in Cargo-style format.
    pub fn format_cargo_style(&self) -> String {
        match self {
            ConfigError::Io { path, source } => {
                format!(
                    "error: cannot access config file\n  --> {}\n  |\n  = {}\n",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse {
                path,
                message,
                line,
                column,
            } => format!(
                "error: malformed config file\n  --> {}:{}:{}\n  |\n  = {}\n  = help: fix or remove the file; it will not be overwritten\n",
                path.display(),
                line,
                column,
                message
            ),
            ConfigError::NoHome => {
                "error: cannot determine home directory\n  = help: pass --config <PATH> or set MEMDOC_CONFIG\n".to_string()
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_cargo_style())
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
