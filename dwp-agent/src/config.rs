// Agent options
//
// Parses the comma separated `key=value` option string the agent is started
// with, e.g. `transport=dt_socket,address=127.0.0.1:55555,server=y,suspend=n`

use crate::protocol::{AgentError, AgentResult};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable whose contents are appended to the option string
pub const EXTRA_OPTIONS_ENV: &str = "DWP_AGENT_EXTRA_OPTIONS";

const DEFER_BASE_PORT: u32 = 56000;

const USAGE: &str = "\
dwp-agent options:
  transport=<transport>    Transport to use, only 'dt_socket' is supported
  address=<hostname>:<port> Address to connect to (server=n) or listen on (server=y)
  loglevel=<n>             Log level, 0 (errors only) to 4 (trace)
  logfile=<file>           Write logs to <file> instead of stderr
  suspend=y/n              Whether to suspend after startup (default y)
  server=y/n               Whether to listen for a client connection (default n)
  onuncaught=y/n           Attach the client when an exception goes unhandled
  onthrow=<type>           Attach the client when <type> is thrown (repeatable)
  timeout=<ms>             Timeout for accepting a client connection
  keepalive=<ms>           Send keepalive events at this interval
  setpgid=y/n              Put the process in its own process group
  help                     Print this message";

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub transport: String,
    pub address: Option<String>,
    pub log_level: u32,
    pub log_file: Option<PathBuf>,
    pub suspend: bool,
    pub server: bool,
    pub onuncaught: bool,
    /// Exception type names that trigger an attach; an empty name matches any
    pub onthrow: Vec<String>,
    pub timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub setpgid: bool,
    /// Listen in the background instead of blocking startup (server=y, suspend=n)
    pub defer: bool,
    pub help: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: String::new(),
            address: None,
            log_level: 0,
            log_file: None,
            suspend: true,
            server: false,
            onuncaught: false,
            onthrow: Vec::new(),
            timeout: None,
            keepalive: None,
            setpgid: false,
            defer: false,
            help: false,
        }
    }
}

impl AgentConfig {
    /// Parse and validate an option string
    pub fn parse(options: &str) -> AgentResult<Self> {
        let mut config = AgentConfig::default();

        for arg in options.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (arg, None),
            };

            match (key, value) {
                ("transport", Some(v)) => config.transport = v.to_string(),
                ("address", Some(v)) => config.address = Some(v.to_string()),
                ("loglevel", Some(v)) => config.log_level = parse_number(key, v)?,
                ("logfile", Some(v)) => config.log_file = Some(PathBuf::from(v)),
                ("suspend", Some(v)) => config.suspend = parse_flag(key, v)?,
                ("server", Some(v)) => config.server = parse_flag(key, v)?,
                ("onuncaught", Some(v)) => config.onuncaught = parse_flag(key, v)?,
                ("onthrow", Some(v)) => config.onthrow.push(v.to_string()),
                ("onthrow", None) => config.onthrow.push(String::new()),
                ("timeout", Some(v)) => {
                    config.timeout = Some(Duration::from_millis(parse_number(key, v)? as u64))
                }
                ("keepalive", Some(v)) => {
                    let ms = parse_number(key, v)?;
                    config.keepalive = (ms > 0).then(|| Duration::from_millis(ms as u64));
                }
                ("setpgid", Some(v)) => config.setpgid = parse_flag(key, v)?,
                ("help", None) => config.help = true,
                _ => {
                    return Err(AgentError::Config(format!("unknown option '{}'", arg)));
                }
            }
        }

        if config.help {
            return Ok(config);
        }

        if config.transport.is_empty() {
            return Err(AgentError::Config("no transport specified".to_string()));
        }
        if config.transport != "dt_socket" {
            return Err(AgentError::Config(format!(
                "unknown transport '{}'",
                config.transport
            )));
        }

        if config.server && !config.suspend {
            config.defer = true;
            if config.address.is_none() {
                config.address = Some(format!(
                    "0.0.0.0:{}",
                    DEFER_BASE_PORT + std::process::id() % 1000
                ));
            }
        }

        if config.address.is_none() && !config.server {
            return Err(AgentError::Config("no address specified".to_string()));
        }

        Ok(config)
    }

    /// Parse `options` with the contents of [`EXTRA_OPTIONS_ENV`] appended
    pub fn from_options_and_env(options: &str) -> AgentResult<Self> {
        match std::env::var(EXTRA_OPTIONS_ENV) {
            Ok(extra) if !extra.trim().is_empty() => {
                Self::parse(&format!("{},{}", options, extra))
            }
            _ => Self::parse(options),
        }
    }

    /// Host and port to bind or connect to.
    ///
    /// A bare port means every interface in server mode and loopback otherwise.
    pub fn socket_address(&self) -> AgentResult<(String, u16)> {
        let address = self.address.as_deref().unwrap_or("0");
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port),
            None if self.server => ("0.0.0.0".to_string(), address),
            None => ("127.0.0.1".to_string(), address),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| AgentError::Config(format!("invalid port in address '{}'", address)))?;
        let host = if host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host
        };
        Ok((host, port))
    }

    /// Attach lazily on an exception instead of at startup
    pub fn jit_attach(&self) -> bool {
        self.onuncaught || !self.onthrow.is_empty()
    }

    /// True if `onthrow` asks to attach for exceptions of this type
    pub fn attach_on_throw(&self, type_name: &str) -> bool {
        self.onthrow.iter().any(|t| t.is_empty() || t == type_name)
    }

    /// Default tracing directive for the configured log level
    pub fn log_directive(&self) -> &'static str {
        match self.log_level {
            0 => "dwp_agent=error",
            1 => "dwp_agent=warn",
            2 => "dwp_agent=info",
            3 => "dwp_agent=debug",
            _ => "dwp_agent=trace",
        }
    }

    pub fn usage() -> &'static str {
        USAGE
    }
}

fn parse_flag(key: &str, value: &str) -> AgentResult<bool> {
    match value {
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" => Ok(false),
        _ => Err(AgentError::Config(format!(
            "'{}' expects y or n, got '{}'",
            key, value
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> AgentResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| AgentError::Config(format!("'{}' expects a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_mode() {
        let config = AgentConfig::parse("transport=dt_socket,address=10.0.0.1:4711").unwrap();
        assert!(config.suspend);
        assert!(!config.server);
        assert!(!config.defer);
        assert_eq!(config.socket_address().unwrap(), ("10.0.0.1".to_string(), 4711));
    }

    #[test]
    fn test_server_without_suspend_defers_with_default_port() {
        let config = AgentConfig::parse("transport=dt_socket,server=y,suspend=n").unwrap();
        assert!(config.defer);
        let (host, port) = config.socket_address().unwrap();
        assert_eq!(host, "0.0.0.0");
        assert!((56000..57000).contains(&(port as u32)));
    }

    #[test]
    fn test_transport_is_mandatory() {
        assert!(matches!(
            AgentConfig::parse("address=1.2.3.4:5"),
            Err(AgentError::Config(_))
        ));
        assert!(AgentConfig::parse("transport=shmem,address=1:2").is_err());
    }

    #[test]
    fn test_address_required_unless_server() {
        assert!(AgentConfig::parse("transport=dt_socket").is_err());
        let config = AgentConfig::parse("transport=dt_socket,server=y").unwrap();
        assert!(!config.defer);
        assert_eq!(config.socket_address().unwrap(), ("0.0.0.0".to_string(), 0));
    }

    #[test]
    fn test_onthrow_and_onuncaught() {
        let config = AgentConfig::parse(
            "transport=dt_socket,address=1.2.3.4:5,onthrow=System.IO.IOException,onthrow",
        )
        .unwrap();
        assert!(config.jit_attach());
        assert_eq!(config.onthrow, vec!["System.IO.IOException".to_string(), String::new()]);
        assert!(config.attach_on_throw("Anything"));

        let config =
            AgentConfig::parse("transport=dt_socket,address=1.2.3.4:5,onthrow=Foo").unwrap();
        assert!(config.attach_on_throw("Foo"));
        assert!(!config.attach_on_throw("Bar"));

        let config =
            AgentConfig::parse("transport=dt_socket,address=1.2.3.4:5,onuncaught=y").unwrap();
        assert!(config.jit_attach());
    }

    #[test]
    fn test_numbers_and_flags() {
        let config = AgentConfig::parse(
            "transport=dt_socket,address=9,loglevel=3,keepalive=250,timeout=1000,setpgid=y",
        )
        .unwrap();
        assert_eq!(config.log_directive(), "dwp_agent=debug");
        assert_eq!(config.keepalive, Some(Duration::from_millis(250)));
        assert_eq!(config.timeout, Some(Duration::from_secs(1)));
        assert!(config.setpgid);
        assert_eq!(config.socket_address().unwrap(), ("127.0.0.1".to_string(), 9));

        assert!(AgentConfig::parse("transport=dt_socket,address=9,suspend=maybe").is_err());
        assert!(AgentConfig::parse("transport=dt_socket,address=9,bogus=1").is_err());
    }

    #[test]
    fn test_help_skips_validation() {
        let config = AgentConfig::parse("help").unwrap();
        assert!(config.help);
        assert!(AgentConfig::usage().contains("transport="));
    }
}
