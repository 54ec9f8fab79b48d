//! Connection options
//!
//! A single option bag shared by every transport. Each transport reads the
//! fields it understands and ignores the rest, so options meant for one
//! scheme never change the behavior of another.

use crate::deadline::Deadline;
use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What to do when an SSH server presents a host key that is not yet known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingHostKeyPolicy {
    /// Refuse the connection (default)
    #[default]
    Reject,
    /// Accept and record the key, then continue
    AutoAdd,
    /// Accept without recording, logging a warning
    Warning,
}

impl MissingHostKeyPolicy {
    /// Get the option value name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::AutoAdd => "autoadd",
            Self::Warning => "warning",
        }
    }
}

impl FromStr for MissingHostKeyPolicy {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(Self::Reject),
            "autoadd" => Ok(Self::AutoAdd),
            "warning" => Ok(Self::Warning),
            other => Err(TetherError::config(format!(
                "unknown missing_host_key_policy '{}' (expected reject, autoadd or warning)",
                other
            ))),
        }
    }
}

/// Options for a single connection attempt
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Program and arguments to start (local, ssh). Accepted and ignored by
    /// the daemon transport.
    pub command: Option<Vec<String>>,
    /// Login name (ssh, smb)
    pub username: Option<String>,
    /// Password (ssh, smb)
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Windows domain (smb); empty means the endpoint's default
    pub domain: Option<String>,
    /// Force the native (`true`) or library (`false`) ssh strategy
    pub use_native: Option<bool>,
    /// Port override (ssh, smb, daemon)
    pub port: Option<u16>,
    /// Unknown host key handling (ssh library strategy)
    pub missing_host_key_policy: MissingHostKeyPolicy,
    /// Private key file for public-key authentication (ssh)
    pub key_path: Option<PathBuf>,
    /// known_hosts file used by the host key policy (ssh)
    pub known_hosts: Option<PathBuf>,
    /// Remote pipe name (smb)
    pub pipe_name: Option<String>,
    /// Deadline for establishing the connection
    #[serde(with = "humantime_opt")]
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON object; unknown keys are ignored
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the command to run
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Set the login name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the Windows domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Force a strategy for transports that have two
    pub fn with_native(mut self, use_native: bool) -> Self {
        self.use_native = Some(use_native);
        self
    }

    /// Override the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the unknown host key policy
    pub fn with_host_key_policy(mut self, policy: MissingHostKeyPolicy) -> Self {
        self.missing_host_key_policy = policy;
        self
    }

    /// Set the private key file
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Set the known_hosts file
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Set the remote pipe name
    pub fn with_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.pipe_name = Some(name.into());
        self
    }

    /// Set the connection deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Start the clock for one connection attempt
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("command", &self.command)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .field("use_native", &self.use_native)
            .field("port", &self.port)
            .field("missing_host_key_policy", &self.missing_host_key_policy)
            .field("key_path", &self.key_path)
            .field("known_hosts", &self.known_hosts)
            .field("pipe_name", &self.pipe_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Local login name from the environment
pub fn local_username() -> Option<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

/// Serde adapter for `Option<Duration>` as human-readable text ("30s", "2m")
mod humantime_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("reject".parse::<MissingHostKeyPolicy>().unwrap(), MissingHostKeyPolicy::Reject);
        assert_eq!(
            "autoadd".parse::<MissingHostKeyPolicy>().unwrap(),
            MissingHostKeyPolicy::AutoAdd
        );
        assert_eq!(
            "warning".parse::<MissingHostKeyPolicy>().unwrap(),
            MissingHostKeyPolicy::Warning
        );
        assert!("trust".parse::<MissingHostKeyPolicy>().is_err());
        assert_eq!(MissingHostKeyPolicy::default(), MissingHostKeyPolicy::Reject);
    }

    #[test]
    fn test_from_json() {
        let options = ConnectOptions::from_json(
            r#"{
                "username": "alice",
                "port": 2222,
                "missing_host_key_policy": "autoadd",
                "timeout": "1m 30s",
                "some_future_option": true
            }"#,
        )
        .unwrap();

        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.port, Some(2222));
        assert_eq!(options.missing_host_key_policy, MissingHostKeyPolicy::AutoAdd);
        assert_eq!(options.timeout, Some(Duration::from_secs(90)));
        assert!(options.use_native.is_none());
    }

    #[test]
    fn test_from_json_rejects_bad_policy() {
        let result = ConnectOptions::from_json(r#"{"missing_host_key_policy": "yes"}"#);
        assert!(matches!(result, Err(TetherError::ConfigError(_))));
    }

    #[test]
    fn test_password_redacted() {
        let options = ConnectOptions::new().with_password("hunter2");
        let debug = format!("{:?}", options);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let json = serde_json::to_string(&options).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_builder() {
        let options = ConnectOptions::new()
            .with_command(["python", "-u"])
            .with_native(false)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(options.command, Some(vec!["python".to_string(), "-u".to_string()]));
        assert_eq!(options.use_native, Some(false));
        assert!(options.deadline().remaining().is_some());
    }
}
