//! Client configuration
//!
//! `ClientOptions` is what callers fill in; `TransportSpec` is the validated
//! result that the client actually acts on. Validation happens once, when
//! the client is constructed, so a bad option never reaches a transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the default agent executable
pub const CLI_PATH_ENV: &str = "COPILOT_CLI_PATH";

/// Environment variable the spawned agent reads its auth token from
pub const AUTH_TOKEN_ENV: &str = "COPILOT_SDK_AUTH_TOKEN";

const DEFAULT_CLI_PATH: &str = "copilot";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid cli_url format: {0}")]
    InvalidUrl(String),

    #[error("Invalid port in cli_url: {0}")]
    InvalidPort(String),

    #[error("cli_url is mutually exclusive with use_stdio and cli_path")]
    ExternalWithSpawn,

    #[error(
        "github_token and use_logged_in_user cannot be used with cli_url (external server manages its own auth)"
    )]
    ExternalWithAuth,
}

// ============================================================================
// Options
// ============================================================================

/// Options for constructing an [`crate::AgentClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Agent executable; defaults to `$COPILOT_CLI_PATH`, then `copilot`
    pub cli_path: Option<String>,

    /// Extra arguments placed before the SDK-managed flags
    pub cli_args: Vec<String>,

    /// Working directory for the spawned agent
    pub cwd: Option<PathBuf>,

    /// Port for spawned TCP mode; 0 lets the agent pick one
    pub port: u16,

    /// Talk over the child's stdio (default) or over a TCP port it opens
    pub use_stdio: Option<bool>,

    /// Connect to an already running agent instead of spawning one
    pub cli_url: Option<String>,

    /// Passed to the agent as `--log-level`
    pub log_level: String,

    /// Start on first session creation if not yet connected
    pub auto_start: bool,

    /// Extra environment for the spawned agent
    pub env: HashMap<String, String>,

    /// Token handed to the agent through [`AUTH_TOKEN_ENV`]
    pub github_token: Option<String>,

    /// Let the agent use the stored login. Defaults to true unless a token
    /// is given.
    pub use_logged_in_user: Option<bool>,

    /// Bound for each step of a graceful process shutdown
    pub shutdown_timeout: Duration,

    /// How long a TCP-mode agent gets to announce its port
    pub startup_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cli_path: None,
            cli_args: Vec::new(),
            cwd: None,
            port: 0,
            use_stdio: None,
            cli_url: None,
            log_level: "debug".to_string(),
            auto_start: true,
            env: HashMap::new(),
            github_token: None,
            use_logged_in_user: None,
            shutdown_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// How to launch the agent process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Validated transport selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// Spawn and talk over stdin/stdout
    Stdio(SpawnConfig),
    /// Spawn, wait for the port announcement on stdout, then connect
    SpawnTcp(SpawnConfig),
    /// Connect to an agent someone else runs
    External { host: String, port: u16 },
}

impl TransportSpec {
    pub fn is_external(&self) -> bool {
        matches!(self, TransportSpec::External { .. })
    }
}

impl ClientOptions {
    /// Validate and turn the options into a transport selection
    pub fn resolve(&self) -> Result<TransportSpec, ConfigError> {
        if let Some(url) = &self.cli_url {
            if self.use_stdio == Some(true) || self.cli_path.is_some() {
                return Err(ConfigError::ExternalWithSpawn);
            }
            if self.github_token.is_some() || self.use_logged_in_user.is_some() {
                return Err(ConfigError::ExternalWithAuth);
            }
            let (host, port) = parse_cli_url(url)?;
            return Ok(TransportSpec::External { host, port });
        }

        let use_stdio = self.use_stdio.unwrap_or(true);
        let spawn = self.spawn_config(use_stdio);
        Ok(if use_stdio {
            TransportSpec::Stdio(spawn)
        } else {
            TransportSpec::SpawnTcp(spawn)
        })
    }

    fn spawn_config(&self, use_stdio: bool) -> SpawnConfig {
        let program = self
            .cli_path
            .clone()
            .or_else(|| std::env::var(CLI_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CLI_PATH.to_string());

        let mut args = self.cli_args.clone();
        args.extend([
            "--headless".to_string(),
            "--no-auto-update".to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ]);

        if use_stdio {
            args.push("--stdio".to_string());
        } else if self.port > 0 {
            args.push("--port".to_string());
            args.push(self.port.to_string());
        }

        let mut env = self.env.clone();
        if let Some(token) = &self.github_token {
            args.push("--auth-token-env".to_string());
            args.push(AUTH_TOKEN_ENV.to_string());
            env.insert(AUTH_TOKEN_ENV.to_string(), token.clone());
        }

        let use_logged_in_user = self
            .use_logged_in_user
            .unwrap_or(self.github_token.is_none());
        if !use_logged_in_user {
            args.push("--no-auto-login".to_string());
        }

        SpawnConfig {
            program,
            args,
            cwd: self.cwd.clone(),
            env,
        }
    }
}

// ============================================================================
// URL parsing
// ============================================================================

/// Parse an external agent address.
///
/// Accepted forms: `port`, `host:port`, `scheme://host[:port][/path]`.
/// A bare port means `localhost`. `http` and `https` supply a default port
/// when none is given.
pub fn parse_cli_url(url: &str) -> Result<(String, u16), ConfigError> {
    let trimmed = url.trim();
    let invalid = || ConfigError::InvalidUrl(url.to_string());

    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, trimmed),
    };
    let default_port = match scheme.as_deref() {
        None => None,
        Some("http") | Some("ws") => Some(80),
        Some("https") | Some("wss") => Some(443),
        Some("tcp") => None,
        Some(_) => return Err(invalid()),
    };

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }

    // Bare port
    if scheme.is_none() && is_port_like(authority) {
        return Ok(("localhost".to_string(), parse_port(authority, url)?));
    }

    let (host, port) = match split_host_port(authority) {
        Some((host, port)) => (host, parse_port(port, url)?),
        None => match default_port {
            Some(port) => (authority, port),
            None => return Err(invalid()),
        },
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

fn is_port_like(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Split `host:port`, leaving bracketed IPv6 hosts intact
fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        let port = authority[end + 1..].strip_prefix(':')?;
        return Some((&authority[..=end], port));
    }
    authority.rsplit_once(':')
}

fn parse_port(text: &str, url: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort(url.to_string());
    if !is_port_like(text) {
        return Err(invalid());
    }
    let port: i64 = text.parse().map_err(|_| invalid())?;
    if !(1..=65535).contains(&port) {
        return Err(invalid());
    }
    u16::try_from(port).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_port() {
        assert_eq!(parse_cli_url("8080").unwrap(), ("localhost".to_string(), 8080));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_cli_url("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            parse_cli_url("[::1]:7001").unwrap(),
            ("::1".to_string(), 7001)
        );
    }

    #[test]
    fn test_parse_url_forms() {
        assert_eq!(
            parse_cli_url("http://localhost:7000").unwrap(),
            ("localhost".to_string(), 7000)
        );
        assert_eq!(
            parse_cli_url("https://example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_cli_url("https://example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_cli_url("http://agent.internal/rpc").unwrap(),
            ("agent.internal".to_string(), 80)
        );
    }

    #[test]
    fn test_parse_invalid_ports() {
        for url in ["localhost:99999", "localhost:0", "localhost:-1", "0", "70000"] {
            assert_eq!(
                parse_cli_url(url),
                Err(ConfigError::InvalidPort(url.to_string())),
                "{url}"
            );
        }
        assert!(matches!(
            parse_cli_url("localhost:abc"),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_invalid_format() {
        for url in ["invalid-url", "", "ftp://host:21", "http://", "tcp://host"] {
            assert!(
                matches!(parse_cli_url(url), Err(ConfigError::InvalidUrl(_))),
                "{url}"
            );
        }
        let message = parse_cli_url("invalid-url").unwrap_err().to_string();
        assert!(message.starts_with("Invalid cli_url format"));
    }

    #[test]
    fn test_resolve_stdio_args() {
        let options = ClientOptions {
            cli_path: Some("/opt/agent".to_string()),
            cli_args: vec!["--verbose".to_string()],
            log_level: "info".to_string(),
            ..Default::default()
        };

        let TransportSpec::Stdio(spawn) = options.resolve().unwrap() else {
            panic!("expected stdio transport");
        };
        assert_eq!(spawn.program, "/opt/agent");
        assert_eq!(
            spawn.args,
            vec![
                "--verbose",
                "--headless",
                "--no-auto-update",
                "--log-level",
                "info",
                "--stdio"
            ]
        );
        assert!(spawn.env.is_empty());
    }

    #[test]
    fn test_resolve_tcp_with_token() {
        let options = ClientOptions {
            cli_path: Some("agent".to_string()),
            use_stdio: Some(false),
            port: 4321,
            github_token: Some("gho_secret".to_string()),
            ..Default::default()
        };

        let TransportSpec::SpawnTcp(spawn) = options.resolve().unwrap() else {
            panic!("expected spawned tcp transport");
        };
        assert!(spawn.args.windows(2).any(|w| w == ["--port", "4321"]));
        assert!(
            spawn
                .args
                .windows(2)
                .any(|w| w == ["--auth-token-env", AUTH_TOKEN_ENV])
        );
        // A token implies not using the stored login
        assert!(spawn.args.contains(&"--no-auto-login".to_string()));
        assert!(!spawn.args.contains(&"--stdio".to_string()));
        assert_eq!(spawn.env.get(AUTH_TOKEN_ENV).map(String::as_str), Some("gho_secret"));
    }

    #[test]
    fn test_resolve_tcp_without_port_lets_agent_pick() {
        let options = ClientOptions {
            cli_path: Some("agent".to_string()),
            use_stdio: Some(false),
            ..Default::default()
        };
        let TransportSpec::SpawnTcp(spawn) = options.resolve().unwrap() else {
            panic!("expected spawned tcp transport");
        };
        assert!(!spawn.args.contains(&"--port".to_string()));
        assert!(!spawn.args.contains(&"--no-auto-login".to_string()));
    }

    #[test]
    fn test_resolve_external() {
        let options = ClientOptions {
            cli_url: Some("http://localhost:7000".to_string()),
            ..Default::default()
        };
        assert_eq!(
            options.resolve().unwrap(),
            TransportSpec::External {
                host: "localhost".to_string(),
                port: 7000
            }
        );
    }

    #[test]
    fn test_resolve_mutually_exclusive() {
        let with_stdio = ClientOptions {
            cli_url: Some("8080".to_string()),
            use_stdio: Some(true),
            ..Default::default()
        };
        assert_eq!(with_stdio.resolve(), Err(ConfigError::ExternalWithSpawn));

        let with_path = ClientOptions {
            cli_url: Some("8080".to_string()),
            cli_path: Some("agent".to_string()),
            ..Default::default()
        };
        assert_eq!(with_path.resolve(), Err(ConfigError::ExternalWithSpawn));

        let with_token = ClientOptions {
            cli_url: Some("8080".to_string()),
            github_token: Some("t".to_string()),
            ..Default::default()
        };
        assert_eq!(with_token.resolve(), Err(ConfigError::ExternalWithAuth));
    }

    #[test]
    fn test_resolve_invalid_url_fails_before_connecting() {
        let options = ClientOptions {
            cli_url: Some("localhost:99999".to_string()),
            ..Default::default()
        };
        assert!(matches!(options.resolve(), Err(ConfigError::InvalidPort(_))));
    }
}
