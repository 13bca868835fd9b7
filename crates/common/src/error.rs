// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

// Error types for Maccaronia Tunnel

use thiserror::Error;

use crate::config::ConfigIssue;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {}", format_issues(.0))]
    Config(Vec<ConfigIssue>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt configuration content: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Sealed configuration could not be opened: {0}")]
    Crypto(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// True for failures of the file or storage layer ("bad file"), as opposed
    /// to `Config`, which means the settings themselves are incomplete.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Parse(_) | Error::Crypto(_) | Error::InvalidPath(_)
        )
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
