//! Command-line and environment configuration
//!
//! Every flag is also readable from the corresponding `WG_<UPPERCASE>`
//! environment variable; a flag on the command line wins over the
//! environment. Durations accept `30s`/`1m`-style values.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::supervisor::Intervals;

/// Control-plane daemon for WireGuard relay hosts
#[derive(Debug, Parser)]
#[command(name = "wg-steward", disable_version_flag = true)]
pub struct Config {
    /// How often wireguard peers are counted and reported to statsd and the api
    #[arg(long, env = "WG_COUNT_PEER_INTERVAL", default_value = "1m", value_parser = parse_duration)]
    pub count_peer_interval: Duration,

    /// How often wireguard peers are synchronized with the api
    #[arg(long, env = "WG_SYNCHRONIZATION_INTERVAL", default_value = "1m", value_parser = parse_duration)]
    pub synchronization_interval: Duration,

    /// How often wireguard peers have their handshakes checked for resets
    #[arg(long, env = "WG_RESET_HANDSHAKE_INTERVAL", default_value = "1m", value_parser = parse_duration)]
    pub reset_handshake_interval: Duration,

    /// Max random delay for the synchronization
    #[arg(long, env = "WG_DELAY", default_value = "45s", value_parser = parse_duration)]
    pub delay: Duration,

    /// Max duration for API requests
    #[arg(long, env = "WG_API_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub api_timeout: Duration,

    /// api url
    #[arg(long, env = "WG_URL", default_value = "https://example.com")]
    pub url: String,

    /// api username
    #[arg(long, env = "WG_USERNAME", default_value = "")]
    pub username: String,

    /// api password
    #[arg(long, env = "WG_PASSWORD", default_value = "")]
    pub password: String,

    /// server hostname
    #[arg(long, env = "WG_HOSTNAME", default_value = "")]
    pub hostname: String,

    /// wireguard interfaces to configure; pass a comma delimited list to
    /// configure multiple interfaces, eg 'wg0,wg1,wg2'
    #[arg(long, env = "WG_INTERFACES", default_value = "wg0")]
    pub interfaces: String,

    /// iptables chain prefix to use for portforwarding
    #[arg(long, env = "WG_PORTFORWARDING_CHAIN_PREFIX", default_value = "PORTFORWARDING")]
    pub portforwarding_chain_prefix: String,

    /// ipset table to use for portforwarding for ipv4 addresses
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV4", default_value = "PORTFORWARDING_IPV4")]
    pub portforwarding_ipset_ipv4: String,

    /// ipset table to use for portforwarding for ipv6 addresses
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV6", default_value = "PORTFORWARDING_IPV6")]
    pub portforwarding_ipset_ipv6: String,

    /// statsd address to send metrics to
    #[arg(long, env = "WG_STATSD_ADDRESS", default_value = "127.0.0.1:8125")]
    pub statsd_address: String,

    /// message-queue url
    #[arg(long, env = "WG_MQ_URL", default_value = "wss://example.com/mq")]
    pub mq_url: String,

    /// message-queue username
    #[arg(long, env = "WG_MQ_USERNAME", default_value = "")]
    pub mq_username: String,

    /// message-queue password
    #[arg(long, env = "WG_MQ_PASSWORD", default_value = "")]
    pub mq_password: String,

    /// message-queue channel
    #[arg(long, env = "WG_MQ_CHANNEL", default_value = "wireguard")]
    pub mq_channel: String,

    /// prints current app version
    #[arg(short = 'v')]
    pub version: bool,
}

impl Config {
    /// The wireguard interface list, validated non-empty
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoInterfaces` when the flag resolves to an
    /// empty list.
    pub fn interface_list(&self) -> Result<Vec<String>, ConfigError> {
        let interfaces: Vec<String> = self
            .interfaces
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
        if interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        Ok(interfaces)
    }

    /// Ticker periods for the supervisor
    #[must_use]
    pub fn intervals(&self) -> Intervals {
        Intervals {
            count_peers: self.count_peer_interval,
            synchronize: self.synchronization_interval,
            reset_handshake: self.reset_handshake_interval,
            synchronize_jitter: self.delay,
        }
    }
}

/// Parse durations of the form `500ms`, `30s`, `1m`, `1h30m`
fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration '{value}'"))?;
        if digits_end == 0 {
            return Err(format!("invalid duration '{value}'"));
        }
        let (digits, tail) = rest.split_at(digits_end);
        let amount: u64 = digits
            .parse()
            .map_err(|e| format!("invalid duration '{value}': {e}"))?;

        let (segment, tail) = if let Some(tail) = tail.strip_prefix("ms") {
            (Duration::from_millis(amount), tail)
        } else if let Some(tail) = tail.strip_prefix("us") {
            (Duration::from_micros(amount), tail)
        } else if let Some(tail) = tail.strip_prefix('s') {
            (Duration::from_secs(amount), tail)
        } else if let Some(tail) = tail.strip_prefix('m') {
            (Duration::from_secs(amount.saturating_mul(60)), tail)
        } else if let Some(tail) = tail.strip_prefix('h') {
            (Duration::from_secs(amount.saturating_mul(3600)), tail)
        } else {
            return Err(format!("unknown unit in duration '{value}'"));
        };

        total += segment;
        rest = tail;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["wg-steward"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.count_peer_interval, Duration::from_secs(60));
        assert_eq!(config.synchronization_interval, Duration::from_secs(60));
        assert_eq!(config.reset_handshake_interval, Duration::from_secs(60));
        assert_eq!(config.delay, Duration::from_secs(45));
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert_eq!(config.interfaces, "wg0");
        assert_eq!(config.portforwarding_chain_prefix, "PORTFORWARDING");
        assert_eq!(config.portforwarding_ipset_ipv4, "PORTFORWARDING_IPV4");
        assert_eq!(config.portforwarding_ipset_ipv6, "PORTFORWARDING_IPV6");
        assert_eq!(config.statsd_address, "127.0.0.1:8125");
        assert_eq!(config.mq_channel, "wireguard");
        assert!(!config.version);
    }

    #[test]
    fn test_interface_list() {
        let config = parse(&["--interfaces", "wg0,wg1, wg2"]);
        assert_eq!(config.interface_list().unwrap(), vec!["wg0", "wg1", "wg2"]);

        let config = parse(&["--interfaces", ""]);
        assert!(matches!(
            config.interface_list(),
            Err(ConfigError::NoInterfaces)
        ));
    }

    #[test]
    fn test_version_flag() {
        let config = parse(&["-v"]);
        assert!(config.version);
    }

    #[test]
    fn test_intervals_follow_flags() {
        let config = parse(&["--synchronization-interval", "5m", "--delay", "10s"]);
        let intervals = config.intervals();
        assert_eq!(intervals.synchronize, Duration::from_secs(300));
        assert_eq!(intervals.synchronize_jitter, Duration::from_secs(10));
    }
}
