//! Environment-driven configuration. Every option is also a CLI flag;
//! durations use Go-style strings (`24h`, `30m`, `10s`).

use std::time::Duration;

use clap::Parser;

/// Besedka chat server
#[derive(Parser, Debug, Clone)]
#[command(name = "besedka-server", version, about = "Self-hosted group chat server")]
pub struct Config {
    /// Path to the embedded database file
    #[arg(long = "db", env = "BESEDKA_DB", default_value = "besedka.db")]
    pub db_file: String,

    /// Public API listener address
    #[arg(long, env = "API_ADDR", default_value = ":8080")]
    pub api_addr: String,

    /// Admin listener address
    #[arg(long, env = "ADMIN_ADDR", default_value = "localhost:8081")]
    pub admin_addr: String,

    /// Base URL used to materialise setup links
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Content-addressed blob directory
    #[arg(long, env = "UPLOADS_PATH", default_value = "uploads")]
    pub uploads_path: String,

    /// base64 HMAC key for password and token hashing
    #[arg(long, env = "AUTH_SECRET", default_value = "")]
    pub auth_secret: String,

    /// Session token lifetime
    #[arg(long, env = "TOKEN_EXPIRY", default_value = "24h", value_parser = parse_duration)]
    pub token_expiry: Duration,

    /// Operator username for the admin listener
    #[arg(long, env = "ADMIN_USER", default_value = "admin")]
    pub admin_user: String,

    /// Operator password for the admin listener
    #[arg(long, env = "ADMIN_PASSWORD", default_value = "")]
    pub admin_password: String,

    /// Period of the token TTL sweeper
    #[arg(long, env = "SWEEP_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub sweep_interval: Duration,

    /// Invite a user via the running admin listener, print the setup link
    /// and exit
    #[arg(long = "add-user", value_name = "USERNAME")]
    pub add_user: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    /// `cli_mode` (the `--add-user` path) talks to a running server and
    /// needs no secret of its own.
    pub fn validate(&self, cli_mode: bool) -> Result<(), String> {
        if self.auth_secret.is_empty() && !cli_mode {
            return Err("AUTH_SECRET is required".to_string());
        }
        if !cli_mode && self.admin_password.is_empty() {
            return Err("ADMIN_PASSWORD is required".to_string());
        }
        if self.token_expiry.is_zero() {
            return Err("TOKEN_EXPIRY must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Turn a listen address into something bindable: `:8080` means all
/// interfaces.
pub fn bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Parse `90`, `90s`, `15m`, `24h` or `500ms`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, multiplier_ms) = if let Some(v) = value.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = value.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = value.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = value.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (value, 1_000)
    };
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    Ok(Duration::from_millis(number * multiplier_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn bind_addrs() {
        assert_eq!(bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_addr("localhost:8081"), "localhost:8081");
    }
}
