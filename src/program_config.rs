use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

pub const MIN_SECRET_LENGTH: usize = 8;
pub const MAX_SECRET_LENGTH: usize = 64;

#[derive(Debug, Parser)]
#[clap(name = "knock-firewall")]
pub struct ProgramConfig {
    #[clap(flatten)]
    pub knock_server: KnockServerConfig,

    /// Port to protect
    #[clap(short = 'm', long = "mask", env = "KNOCK_MASK", default_value = "22")]
    pub protected_port: u16,

    /// Run as daemon (plain log output for service supervisors)
    #[clap(short, long, env = "KNOCK_DAEMON")]
    pub daemon: bool,

    /// Default duration of an authorization, in seconds
    #[clap(long, env = "KNOCK_GRANT_TIME", default_value = "15")]
    pub grant_time: u32,

    /// Firewall backend
    #[clap(
        long = "firewall",
        env = "KNOCK_FIREWALL",
        value_enum,
        ignore_case = true,
        default_value = "iptables"
    )]
    pub firewall: FirewallKind,

    /// Authentication mode
    #[clap(subcommand)]
    pub auth: AuthConfig,
}

#[derive(Clone, Copy, Debug, Args)]
pub struct KnockServerConfig {
    /// Port to listen on for knocks (0 for random)
    #[clap(short = 'p', long = "port", env = "KNOCK_PORT", default_value = "0")]
    pub port: u16,

    /// IPv4 address to bind the knock server to
    #[clap(long, env = "KNOCK_BIND", default_value = "0.0.0.0")]
    pub bind: Ipv4Addr,

    /// Maximum number of concurrent connections
    #[clap(long, env = "KNOCK_MAX_CONNECTIONS", default_value = "100")]
    pub max_connections: u32,

    /// Authentication timeout, in seconds
    #[clap(long, env = "KNOCK_TIMEOUT", default_value = "5")]
    pub timeout: u32,
}

#[derive(Debug, Subcommand)]
pub enum AuthConfig {
    /// Use password authentication
    Password {
        /// Shared secret clients have to send (8 to 64 bytes)
        #[clap(long, env = "KNOCK_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[allow(non_camel_case_types)]
pub enum FirewallKind {
    none,
    iptables,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "Invalid password length {0} (expected {MIN_SECRET_LENGTH} to {MAX_SECRET_LENGTH} bytes)"
    )]
    InvalidSecretLength(usize),

    #[error("Invalid protected port 0")]
    InvalidProtectedPort,

    #[error("{0} must be at least one second")]
    ZeroDuration(&'static str),

    #[error("Maximum number of connections must be at least 1")]
    ZeroConnections,
}

impl ProgramConfig {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protected_port == 0 {
            return Err(ConfigError::InvalidProtectedPort);
        }
        if self.grant_time == 0 {
            return Err(ConfigError::ZeroDuration("Grant time"));
        }
        if self.knock_server.timeout == 0 {
            return Err(ConfigError::ZeroDuration("Timeout"));
        }
        if self.knock_server.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        match &self.auth {
            AuthConfig::Password { password } => validate_secret(password.as_bytes()),
        }
    }

    pub fn grant_time(&self) -> Duration {
        Duration::from_secs(self.grant_time as u64)
    }
}

pub fn validate_secret(secret: &[u8]) -> Result<(), ConfigError> {
    if (MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH).contains(&secret.len()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSecretLength(secret.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(args: &[&str]) -> ProgramConfig {
        ProgramConfig::try_parse_from(std::iter::once("knock-firewall").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&["password", "--password", "abc12345"]);

        assert_eq!(config.knock_server.port, 0);
        assert_eq!(config.knock_server.bind, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.knock_server.timeout, 5);
        assert_eq!(config.protected_port, 22);
        assert_eq!(config.grant_time(), Duration::from_secs(15));
        assert_eq!(config.firewall, FirewallKind::iptables);
        assert!(!config.daemon);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn short_flags() {
        let config = parse(&[
            "-p",
            "5000",
            "-m",
            "2222",
            "-d",
            "--firewall",
            "NONE",
            "password",
            "--password",
            "abc12345",
        ]);

        assert_eq!(config.knock_server.port, 5000);
        assert_eq!(config.protected_port, 2222);
        assert!(config.daemon);
        assert_eq!(config.firewall, FirewallKind::none);
    }

    #[test]
    fn secret_length_bounds() {
        assert_eq!(validate_secret(b"1234567"), Err(ConfigError::InvalidSecretLength(7)));
        assert_eq!(validate_secret(b"12345678"), Ok(()));
        assert_eq!(validate_secret(&[b'x'; 64]), Ok(()));
        assert_eq!(validate_secret(&[b'x'; 65]), Err(ConfigError::InvalidSecretLength(65)));

        let config = parse(&["password", "--password", "short"]);
        assert_matches!(config.validate(), Err(ConfigError::InvalidSecretLength(5)));
    }

    #[test]
    fn protected_port_must_be_set() {
        let config = parse(&["-m", "0", "password", "--password", "abc12345"]);
        assert_eq!(config.validate(), Err(ConfigError::InvalidProtectedPort));
    }

    #[test]
    fn auth_mode_is_required() {
        assert!(ProgramConfig::try_parse_from(["knock-firewall"]).is_err());
    }
}
