//! Host configuration parsed from environment variables.

use crate::kernel::message::Identity;

pub const DEFAULT_PROTOCOL_VERSION: &str = "5.3";
pub const DEFAULT_RENDERER_RANK: i32 = -100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be an integer, got {value:?}")]
    InvalidInteger { var: &'static str, value: String },
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Overrides the kernel connection's username in outbound headers.
    pub username: Option<String>,
    /// Overrides the kernel connection's client id in outbound headers.
    pub session_id: Option<String>,
    /// Messaging protocol version for outbound headers.
    pub protocol_version: String,
    /// Renderer rank; lower ranks win over the default widget renderer (-10).
    pub renderer_rank: i32,
}

impl HostConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `RICHOUTPUT_USERNAME`: default is the kernel connection's username
    /// - `RICHOUTPUT_SESSION_ID`: default is the kernel connection's client id
    /// - `RICHOUTPUT_PROTOCOL_VERSION`: default `"5.3"`
    /// - `RICHOUTPUT_RENDERER_RANK`: default -100
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but empty, or if the rank is
    /// not an integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`HostConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let username = non_empty(&lookup, "RICHOUTPUT_USERNAME")?;
        let session_id = non_empty(&lookup, "RICHOUTPUT_SESSION_ID")?;
        let protocol_version =
            non_empty(&lookup, "RICHOUTPUT_PROTOCOL_VERSION")?.unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_owned());
        let renderer_rank = parse_rank(non_empty(&lookup, "RICHOUTPUT_RENDERER_RANK")?)?;

        Ok(Self { username, session_id, protocol_version, renderer_rank })
    }

    /// Header identity for a kernel connection that reports
    /// `kernel_username` and `kernel_client_id`. Configured values win.
    #[must_use]
    pub fn identity(&self, kernel_username: String, kernel_client_id: String) -> Identity {
        Identity {
            username: self.username.clone().unwrap_or(kernel_username),
            session: self.session_id.clone().unwrap_or(kernel_client_id),
            version: self.protocol_version.clone(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            username: None,
            session_id: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_owned(),
            renderer_rank: DEFAULT_RENDERER_RANK,
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<String>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { var }),
        Some(value) => Ok(Some(value.trim().to_owned())),
    }
}

fn parse_rank(raw: Option<String>) -> Result<i32, ConfigError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_RENDERER_RANK);
    };
    raw.parse::<i32>()
        .map_err(|_| ConfigError::InvalidInteger { var: "RICHOUTPUT_RENDERER_RANK", value: raw })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
