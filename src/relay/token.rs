//! Bearer tokens for the upstream connection.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RelayError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, RelayError>;
}

/// A fixed token, e.g. from `RELAY_BEARER_TOKEN`.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, RelayError> {
        if self.0.is_empty() {
            return Err(RelayError::Token("empty token".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Runs a command that prints an access token and caches the result.
pub struct CommandToken {
    program: String,
    args: Vec<String>,
    ttl: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl CommandToken {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(45 * 60);

    /// `command_line` is split on whitespace; no shell is involved.
    pub fn new(command_line: &str) -> Result<Self, RelayError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| RelayError::Token("empty token command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            ttl: Self::DEFAULT_TTL,
            cached: Mutex::new(None),
        })
    }

    /// Application-default credentials through the gcloud CLI.
    pub fn gcloud() -> Self {
        Self {
            program: "gcloud".to_string(),
            args: vec!["auth".to_string(), "print-access-token".to_string()],
            ttl: Self::DEFAULT_TTL,
            cached: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn fetch(&self) -> Result<String, RelayError> {
        debug!("Running token command {}", self.program);
        let output = Command::new(&self.program).args(&self.args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Token(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(RelayError::Token(format!("{} printed no token", self.program)));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for CommandToken {
    async fn token(&self) -> Result<String, RelayError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched)) = cached.as_ref() {
            if fetched.elapsed() < self.ttl {
                return Ok(token.clone());
            }
        }
        let token = self.fetch().await?;
        info!("Fetched a new access token");
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_must_not_be_empty() {
        assert_eq!(StaticToken::new("abc").token().await.unwrap(), "abc");
        assert!(matches!(StaticToken::new("").token().await, Err(RelayError::Token(_))));
    }

    #[tokio::test]
    async fn command_token_is_trimmed_and_cached() {
        let provider = CommandToken::new("echo  ya29.token ").unwrap();
        assert_eq!(provider.token().await.unwrap(), "ya29.token");
        assert!(provider.cached.lock().await.is_some());
        assert_eq!(provider.token().await.unwrap(), "ya29.token");
    }

    #[tokio::test]
    async fn failing_command_is_a_token_error() {
        let provider = CommandToken::new("false").unwrap();
        assert!(matches!(provider.token().await, Err(RelayError::Token(_))));
        assert!(CommandToken::new("   ").is_err());
    }
}
