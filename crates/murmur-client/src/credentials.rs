//! Auth token sources.
//!
//! The client asks its [`TokenProvider`] for a token on every dial, so a
//! rotated token is picked up on the next reconnect.

use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read-only source of the current auth token. `None` means anonymous.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token read from an environment variable at dial time.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

#[derive(Deserialize)]
struct StoredToken {
    token: Option<String>,
}

/// Token persisted in a file by whoever handles login.
///
/// The file holds either the bare token or a JSON object with a `token`
/// field. A missing file means anonymous.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// `~` in the path is expanded.
    pub fn new(path: impl AsRef<str>) -> Self {
        let expanded = shellexpand::tilde(path.as_ref());
        Self {
            path: PathBuf::from(expanded.as_ref()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(contents: &str) -> Option<String> {
        let contents = contents.trim();
        if contents.starts_with('{') {
            return match serde_json::from_str::<StoredToken>(contents) {
                Ok(stored) => stored.token.filter(|token| !token.is_empty()),
                Err(e) => {
                    warn!(error = %e, "Token file is not valid JSON");
                    None
                }
            };
        }
        (!contents.is_empty()).then(|| contents.to_string())
    }
}

impl TokenProvider for FileTokenStore {
    fn token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No token file, connecting anonymously");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                None
            }
        }
    }
}
