use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Gateway-wide settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Backends, in the order they are started
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Address the public listeners bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// How the backend pid is written before relaying starts
    #[serde(default)]
    pub preamble: PreambleFormat,

    /// Upper bound for listeners and waiting sessions to wind down on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            preamble: PreambleFormat::default(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Wire format of the pid preamble
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreambleFormat {
    /// Decimal digits only, backend bytes follow immediately
    #[default]
    Bare,
    /// Decimal digits followed by a single `\n`
    Line,
}

impl PreambleFormat {
    pub fn render(&self, pid: u32) -> String {
        match self {
            PreambleFormat::Bare => pid.to_string(),
            PreambleFormat::Line => format!("{}\n", pid),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Interval between listen checks in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds without readiness before a backend is reported stuck (0 disables)
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    /// Seconds a client may wait for readiness (unset means forever)
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Interval between health probe attempts in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    /// Timeout for a single health probe attempt in milliseconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stuck_after_secs: default_stuck_after(),
            wait_timeout_secs: None,
            stop_timeout_secs: default_stop_timeout(),
            health_interval_ms: default_health_interval(),
            health_timeout_ms: default_health_timeout(),
        }
    }
}

/// When the backend process is spawned
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Spawned when the gateway starts (default)
    #[default]
    Eager,
    /// Spawned when the first client connection is admitted
    OnDemand,
}

/// When health probing begins relative to the listen check
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStart {
    /// Probe only once the local port accepts connections (default)
    #[default]
    AfterListen,
    /// Probe from process start, in parallel with the listen check
    Immediate,
}

/// Health probe strategy
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeConfig {
    /// Connect-and-close on a port (defaults to the backend port)
    Tcp {
        #[serde(default)]
        port: Option<u16>,
    },
    /// HTTP GET expecting a 2xx status
    Http {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_health_path")]
        path: String,
    },
    /// Run a command; exit status 0 passes
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    /// The probe to run
    pub probe: ProbeConfig,

    /// Whether probing waits for the listen check
    #[serde(default)]
    pub start: ProbeStart,

    /// Extra delay before the first probe, measured from listen success
    /// (`after_listen`) or from process start (`immediate`)
    #[serde(default)]
    pub grace_period_ms: u64,

    /// Interval between probe attempts (overrides default)
    pub interval_ms: Option<u64>,

    /// Timeout for one probe attempt (overrides default)
    pub timeout_ms: Option<u64>,
}

impl HealthCheckConfig {
    pub fn interval(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(defaults.health_interval_ms))
    }

    pub fn timeout(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(defaults.health_timeout_ms))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// `command`, `args` and command probes are executed directly with the
/// permissions of the gateway. Configuration files must only be writable by
/// trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Name used in logs; must be unique
    pub name: String,

    /// Command to execute. When `args` is empty this is split into words.
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the backend will listen on
    pub port: u16,

    /// Port the gateway accepts clients on for this backend
    pub public_port: u16,

    /// Host the gateway dials to reach the backend
    #[serde(default = "default_target_host")]
    pub target_host: String,

    /// When to spawn the backend
    #[serde(default)]
    pub start: StartMode,

    /// Optional health probe required in addition to the listen check
    pub health_check: Option<HealthCheckConfig>,

    /// Listen check interval in milliseconds (overrides default)
    pub poll_interval_ms: Option<u64>,

    /// Stuck threshold in seconds (overrides default, 0 disables)
    pub stuck_after_secs: Option<u64>,

    /// Client wait deadline in seconds (overrides default)
    pub wait_timeout_secs: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL (overrides default)
    pub stop_timeout_secs: Option<u64>,
}

impl BackendConfig {
    /// Create a backend config with defaults
    pub fn new(name: &str, command: &str, port: u16, public_port: u16) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port,
            public_port,
            target_host: default_target_host(),
            start: StartMode::default(),
            health_check: None,
            poll_interval_ms: None,
            stuck_after_secs: None,
            wait_timeout_secs: None,
            stop_timeout_secs: None,
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the health check (builder pattern)
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// Program and argument list to execute
    pub fn program_and_args(&self) -> Result<(String, Vec<String>), String> {
        if !self.args.is_empty() {
            return Ok((self.command.clone(), self.args.clone()));
        }
        let mut words = shell_words::split(&self.command)
            .map_err(|e| format!("cannot split command '{}': {}", self.command, e))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| "command is empty".to_string())?;
        Ok((program, words.collect()))
    }

    pub fn poll_interval(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms))
    }

    pub fn stuck_after(&self, defaults: &BackendDefaults) -> Option<Duration> {
        match self.stuck_after_secs.unwrap_or(defaults.stuck_after_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn wait_timeout(&self, defaults: &BackendDefaults) -> Option<Duration> {
        self.wait_timeout_secs
            .or(defaults.wait_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn stop_timeout(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(self.stop_timeout_secs.unwrap_or(defaults.stop_timeout_secs))
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("backend 'name' must not be empty".to_string());
        }

        if let Err(e) = self.program_and_args() {
            return Err(format!("Backend '{}': {}", self.name, e));
        }

        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                self.name
            ));
        }

        if self.public_port == 0 {
            return Err(format!(
                "Backend '{}': 'public_port' must be greater than 0",
                self.name
            ));
        }

        if let Some(ref health_check) = self.health_check {
            match &health_check.probe {
                ProbeConfig::Http { path, .. } if !path.starts_with('/') => {
                    return Err(format!(
                        "Backend '{}': http probe path must start with '/'",
                        self.name
                    ));
                }
                ProbeConfig::Command { command, .. } if command.trim().is_empty() => {
                    return Err(format!(
                        "Backend '{}': command probe requires a command",
                        self.name
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Problems with resolved polling intervals and probe timeouts
    pub fn validate_timing(&self, defaults: &BackendDefaults) -> Vec<String> {
        let mut errors = Vec::new();

        if self.poll_interval(defaults).is_zero() {
            errors.push(format!(
                "Backend '{}': poll interval must be greater than 0",
                self.name
            ));
        }

        if let Some(ref health_check) = self.health_check {
            if health_check.interval(defaults).is_zero() {
                errors.push(format!(
                    "Backend '{}': health check interval must be greater than 0",
                    self.name
                ));
            }
            if health_check.timeout(defaults).is_zero() {
                errors.push(format!(
                    "Backend '{}': health check timeout must be greater than 0",
                    self.name
                ));
            }
        }

        errors
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    100 // 100ms
}

fn default_stuck_after() -> u64 {
    120 // model servers routinely need a minute or more
}

fn default_stop_timeout() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_health_interval() -> u64 {
    500
}

fn default_health_timeout() -> u64 {
    2000
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, collecting every problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        let mut public_ports = HashSet::new();

        if self.backends.is_empty() {
            errors.push("at least one backend must be configured".to_string());
        }

        for backend in &self.backends {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            errors.extend(backend.validate_timing(&self.defaults));
            if !names.insert(backend.name.as_str()) {
                errors.push(format!("Backend '{}': duplicate name", backend.name));
            }
            if !public_ports.insert(backend.public_port) {
                errors.push(format!(
                    "Backend '{}': public_port {} is already used by another backend",
                    backend.name, backend.public_port
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[gateway]
bind = "127.0.0.1"
preamble = "line"

[defaults]
poll_interval_ms = 250
stuck_after_secs = 300

[[backends]]
name = "llama"
command = "llama-server"
args = ["--port", "9100"]
port = 9100
public_port = 2001

[backends.health_check]
start = "immediate"
grace_period_ms = 1500

[backends.health_check.probe]
type = "http"
port = 9101
path = "/ready"

[[backends]]
name = "whisper"
command = "python -m whisper_server"
port = 9200
public_port = 2002
start = "on_demand"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.preamble, PreambleFormat::Line);
        assert_eq!(config.defaults.poll_interval_ms, 250);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].name, "llama");
        assert_eq!(config.backends[1].name, "whisper");
        assert_eq!(config.backends[1].start, StartMode::OnDemand);

        let health = config.backends[0].health_check.as_ref().unwrap();
        assert_eq!(health.start, ProbeStart::Immediate);
        assert_eq!(health.grace_period(), Duration::from_millis(1500));
        assert_eq!(
            health.probe,
            ProbeConfig::Http {
                port: Some(9101),
                path: "/ready".to_string()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_gateway_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.preamble, PreambleFormat::Bare);
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_backend_defaults() {
        let defaults = BackendDefaults::default();
        assert_eq!(defaults.poll_interval_ms, 100);
        assert_eq!(defaults.stuck_after_secs, 120);
        assert_eq!(defaults.wait_timeout_secs, None);
        assert_eq!(defaults.stop_timeout_secs, 10);
        assert_eq!(defaults.health_interval_ms, 500);
        assert_eq!(defaults.health_timeout_ms, 2000);
    }

    #[test]
    fn test_backend_config_uses_defaults() {
        let defaults = BackendDefaults::default();
        let backend: BackendConfig = toml::from_str(
            r#"
name = "api"
command = "node server.js"
port = 3000
public_port = 8000
"#,
        )
        .unwrap();

        assert_eq!(backend.poll_interval(&defaults), Duration::from_millis(100));
        assert_eq!(backend.stuck_after(&defaults), Some(Duration::from_secs(120)));
        assert_eq!(backend.wait_timeout(&defaults), None);
        assert_eq!(backend.stop_timeout(&defaults), Duration::from_secs(10));
        assert_eq!(backend.target_host, "127.0.0.1");
        assert_eq!(backend.start, StartMode::Eager);
        assert!(backend.health_check.is_none());
    }

    #[test]
    fn test_backend_config_overrides_defaults() {
        let defaults = BackendDefaults::default();
        let backend: BackendConfig = toml::from_str(
            r#"
name = "api"
command = "node"
port = 3000
public_port = 8000
poll_interval_ms = 20
stuck_after_secs = 0
wait_timeout_secs = 45
stop_timeout_secs = 3
"#,
        )
        .unwrap();

        assert_eq!(backend.poll_interval(&defaults), Duration::from_millis(20));
        assert_eq!(backend.stuck_after(&defaults), None);
        assert_eq!(backend.wait_timeout(&defaults), Some(Duration::from_secs(45)));
        assert_eq!(backend.stop_timeout(&defaults), Duration::from_secs(3));
    }

    #[test]
    fn test_health_check_defaults() {
        let defaults = BackendDefaults::default();
        let health: HealthCheckConfig = toml::from_str(
            r#"
[probe]
type = "tcp"
"#,
        )
        .unwrap();

        assert_eq!(health.probe, ProbeConfig::Tcp { port: None });
        assert_eq!(health.start, ProbeStart::AfterListen);
        assert_eq!(health.grace_period(), Duration::ZERO);
        assert_eq!(health.interval(&defaults), Duration::from_millis(500));
        assert_eq!(health.timeout(&defaults), Duration::from_millis(2000));
    }

    #[test]
    fn test_command_probe_parsing() {
        let health: HealthCheckConfig = toml::from_str(
            r#"
interval_ms = 1000
timeout_ms = 300

[probe]
type = "command"
command = "curl"
args = ["-sf", "http://127.0.0.1:9100/health"]
"#,
        )
        .unwrap();
        let defaults = BackendDefaults::default();

        assert_eq!(health.interval(&defaults), Duration::from_millis(1000));
        assert_eq!(health.timeout(&defaults), Duration::from_millis(300));
        match health.probe {
            ProbeConfig::Command { command, args } => {
                assert_eq!(command, "curl");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected probe {:?}", other),
        }
    }

    #[test]
    fn test_http_probe_default_path() {
        let probe: ProbeConfig = toml::from_str(r#"type = "http""#).unwrap();
        assert_eq!(
            probe,
            ProbeConfig::Http {
                port: None,
                path: "/health".to_string()
            }
        );
    }

    #[test]
    fn test_program_and_args() {
        let backend = BackendConfig::new("a", "python -m 'my server'", 1, 2);
        let (program, args) = backend.program_and_args().unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, vec!["-m", "my server"]);

        // Explicit args keep the command verbatim
        let backend = BackendConfig::new("a", "/opt/my app/bin", 1, 2)
            .with_args(vec!["--port".to_string(), "1".to_string()]);
        let (program, args) = backend.program_and_args().unwrap();
        assert_eq!(program, "/opt/my app/bin");
        assert_eq!(args, vec!["--port", "1"]);

        let backend = BackendConfig::new("a", "   ", 1, 2);
        assert!(backend.program_and_args().is_err());
    }

    #[test]
    fn test_preamble_render() {
        assert_eq!(PreambleFormat::Bare.render(4242), "4242");
        assert_eq!(PreambleFormat::Line.render(4242), "4242\n");
    }

    #[test]
    fn test_validate_ports_nonzero() {
        let backend = BackendConfig::new("a", "node", 0, 2000);
        assert!(backend
            .validate()
            .unwrap_err()
            .contains("'port' must be greater than 0"));

        let backend = BackendConfig::new("a", "node", 3000, 0);
        assert!(backend
            .validate()
            .unwrap_err()
            .contains("'public_port' must be greater than 0"));
    }

    #[test]
    fn test_validate_http_path() {
        let backend = BackendConfig::new("a", "node", 3000, 2000).with_health_check(
            HealthCheckConfig {
                probe: ProbeConfig::Http {
                    port: None,
                    path: "health".to_string(),
                },
                start: ProbeStart::AfterListen,
                grace_period_ms: 0,
                interval_ms: None,
                timeout_ms: None,
            },
        );
        assert!(backend.validate().unwrap_err().contains("must start with '/'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[[backends]]
name = "a"
command = ""
port = 3000
public_port = 2000

[[backends]]
name = "a"
command = "node"
port = 3001
public_port = 2000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("command is empty"));
        assert!(err.contains("duplicate name"));
        assert!(err.contains("public_port 2000 is already used"));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let toml = r#"
[[backends]]
name = "busy"
command = "node"
port = 3000
public_port = 2000
poll_interval_ms = 0

[backends.health_check]
interval_ms = 0
timeout_ms = 0

[backends.health_check.probe]
type = "tcp"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid(errors) => assert_eq!(
                errors,
                vec![
                    "Backend 'busy': poll interval must be greater than 0".to_string(),
                    "Backend 'busy': health check interval must be greater than 0".to_string(),
                    "Backend 'busy': health check timeout must be greater than 0".to_string(),
                ]
            ),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_default_poll_interval() {
        let toml = r#"
[defaults]
poll_interval_ms = 0

[[backends]]
name = "inherits"
command = "node"
port = 3000
public_port = 2000

[[backends]]
name = "overrides"
command = "node"
port = 3001
public_port = 2001
poll_interval_ms = 50
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Backend 'inherits': poll interval must be greater than 0"));
        assert!(!err.contains("'overrides'"));
    }

    #[test]
    fn test_validate_requires_backends() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least one backend"));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[backends]]
name = "echo"
command = "sleep 60"
port = 3000
public_port = 2000
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].name, "echo");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/slowgate.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/slowgate.toml"));
    }
}
