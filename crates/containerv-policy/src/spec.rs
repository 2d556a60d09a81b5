//! Network and resource policy descriptions.
//!
//! A destination is written `host[/prefix][:port]`, where `host` is an IP
//! literal (IPv6 in brackets when a port follows) or a resolvable name.

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::str::FromStr;

use containerv_common::error::{ContainervError, Result};
use serde::{Deserialize, Serialize};

/// An allowed network destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    /// IP literal or host name.
    pub host: String,
    /// Prefix length; `None` means a single address.
    pub prefix: Option<u8>,
    /// Port; `None` means any port.
    pub port: Option<u16>,
}

impl Destination {
    /// Resolves the host to addresses. IP literals resolve to themselves.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` if a name does not resolve or the prefix is
    /// too long for an address family.
    pub fn resolve(&self) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = if let Ok(ip) = self.host.parse::<IpAddr>() {
            vec![ip]
        } else {
            let mut addrs: Vec<IpAddr> = (self.host.as_str(), 0)
                .to_socket_addrs()
                .map_err(|e| {
                    ContainervError::invalid(format!("cannot resolve {}: {e}", self.host))
                })?
                .map(|sa| sa.ip())
                .collect();
            addrs.sort_unstable();
            addrs.dedup();
            addrs
        };
        if let Some(prefix) = self.prefix {
            for addr in &addrs {
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(ContainervError::invalid(format!(
                        "prefix /{prefix} too long for {addr}"
                    )));
                }
            }
        }
        Ok(addrs)
    }
}

impl FromStr for Destination {
    type Err = ContainervError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| ContainervError::invalid(format!("bad destination {s:?}: {why}"));

        let (host_part, port) = if let Some(rest) = s.strip_prefix('[') {
            let (inside, after) = rest.split_once(']').ok_or_else(|| bad("unclosed '['"))?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(|| bad("junk after ']'"))?),
            };
            (inside, port)
        } else if s.matches(':').count() == 1 {
            let (host, port) = s.split_once(':').ok_or_else(|| bad("missing port"))?;
            (host, Some(port))
        } else {
            (s, None)
        };

        let (host, prefix) = match host_part.split_once('/') {
            Some((host, prefix)) => (
                host,
                Some(prefix.parse::<u8>().map_err(|_| bad("prefix is not a number"))?),
            ),
            None => (host_part, None),
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        if host.parse::<IpAddr>().is_err()
            && !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(bad("host is neither an address nor a name"));
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| bad("port is not a number")))
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            prefix,
            port,
        })
    }
}

impl TryFrom<String> for Destination {
    type Error = ContainervError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Destination> for String {
    fn from(d: Destination) -> Self {
        d.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracket = self.port.is_some() && self.host.contains(':');
        if bracket {
            write!(f, "[")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(prefix) = self.prefix {
            write!(f, "/{prefix}")?;
        }
        if bracket {
            write!(f, "]")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Traffic limits for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    /// Total bytes allowed; `None` is unlimited.
    pub max_bytes: Option<u64>,
    /// Sustained rate; `None` is unlimited.
    pub rate_bytes_per_sec: Option<u64>,
}

/// Policy installed for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    /// Allowed destinations. Empty allows nothing beyond loopback.
    pub destinations: Vec<Destination>,
    /// Traffic limits.
    pub quota: Quota,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Destination {
        s.parse().expect("valid destination")
    }

    #[test]
    fn parses_every_form() {
        assert_eq!(
            parse("10.0.0.0/8:443"),
            Destination {
                host: "10.0.0.0".into(),
                prefix: Some(8),
                port: Some(443),
            }
        );
        assert_eq!(parse("registry.local").port, None);
        assert_eq!(parse("registry.local:5000").port, Some(5000));
        assert_eq!(parse("fd00::/64").prefix, Some(64));
        assert_eq!(parse("[fd00::1]:53").host, "fd00::1");
    }

    #[test]
    fn display_round_trips_bracketed_ipv6() {
        assert_eq!(parse("[fd00::1/128]:53").to_string(), "[fd00::1/128]:53");
        assert_eq!(parse("10.1.2.3:80").to_string(), "10.1.2.3:80");
    }

    #[test]
    fn rejects_malformed_destinations() {
        for bad in ["", ":80", "10.0.0.1:http", "10.0.0.0/x", "[::1", "bad host", "a/300"] {
            assert!(
                matches!(bad.parse::<Destination>(), Err(ContainervError::InvalidSpec { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn prefix_longer_than_family_fails_on_resolve() {
        assert!(parse("10.0.0.1/33").resolve().is_err());
        assert_eq!(parse("10.0.0.1/32").resolve().expect("resolve").len(), 1);
    }

    #[test]
    fn spec_deserializes_from_strings() {
        let spec: PolicySpec = serde_json::from_str(
            r#"{"destinations": ["10.0.0.0/8:443"], "quota": {"max_bytes": 1048576}}"#,
        )
        .expect("parse");
        assert_eq!(spec.destinations[0].prefix, Some(8));
        assert_eq!(spec.quota.max_bytes, Some(1_048_576));
        assert_eq!(spec.quota.rate_bytes_per_sec, None);

        let bad = serde_json::from_str::<PolicySpec>(r#"{"destinations": ["::x:1:"]}"#);
        assert!(bad.is_err());
    }
}
