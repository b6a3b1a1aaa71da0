//! Parsing of the opaque [`Target`] string (§3, §6 EBNF).
//!
//! ```text
//! target      = [ "dns:" ] [ "//" authority "/" ] host [ ":" port ]
//!             | ipv4 [ ":" port ]
//!             | "[" ipv6 "]" [ ":" port ]
//!             | ipv6
//! ```

use crate::error::{Error, ErrorKind};
use std::{fmt, net::IpAddr, str::FromStr};

const DEFAULT_PORT: u16 = 443;

/// The parsed form of a channel's target string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A literal IP address, already fully resolved.
    Literal { ip: IpAddr, port: u16 },
    /// A `dns:[//authority/]host[:port]` target to be resolved by name.
    Dns {
        authority: Option<String>,
        host: String,
        port: u16,
    },
}

impl Target {
    /// Parse a target string per the grammar in §6. Rejects malformed
    /// targets at construction time (§4.2 step 1).
    pub fn parse(target: &str) -> Result<Self, Error> {
        let rest = target.strip_prefix("dns:").unwrap_or(target);

        if let Some(stripped) = rest.strip_prefix('[') {
            // "[" ipv6 "]" [ ":" port ]
            let close = stripped
                .find(']')
                .ok_or_else(|| invalid(target, "unterminated ipv6 literal"))?;
            let (ip_str, remainder) = stripped.split_at(close);
            let ip = IpAddr::from_str(ip_str).map_err(|_| invalid(target, "bad ipv6 literal"))?;
            let remainder = &remainder[1..]; // drop ']'
            let port = parse_optional_port(remainder, target)?;
            return Ok(Target::Literal { ip, port });
        }

        // Bare ipv6 with no brackets and no port (§6 alternative production).
        if rest.matches(':').count() >= 2 {
            if let Ok(ip) = IpAddr::from_str(rest) {
                return Ok(Target::Literal {
                    ip,
                    port: DEFAULT_PORT,
                });
            }
        }

        let (authority, rest) = if let Some(stripped) = rest.strip_prefix("//") {
            let slash = stripped
                .find('/')
                .ok_or_else(|| invalid(target, "missing '/' after authority"))?;
            let (authority, rest) = stripped.split_at(slash);
            (Some(authority.to_string()), &rest[1..])
        } else {
            (None, rest)
        };

        let (host_str, port) = split_host_port(rest, target)?;

        if let Ok(ip) = IpAddr::from_str(host_str) {
            return Ok(Target::Literal { ip, port });
        }

        if host_str.is_empty() {
            return Err(invalid(target, "empty host"));
        }
        validate_dns_name(host_str, target)?;

        Ok(Target::Dns {
            authority,
            host: host_str.to_string(),
            port,
        })
    }

    /// `getDefaultAuthority(target)` (§4.2): the IP literal or DNS hostname,
    /// used as the `:authority`/SNI default absent an override.
    pub fn default_authority(&self) -> String {
        match self {
            Target::Literal { ip, port } => format_address(ip, *port),
            Target::Dns { host, port, .. } => format!("{host}:{port}"),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Target::Literal { .. })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_authority())
    }
}

/// Format an `(ip, port)` pair as the wire `Address` string (§3): `"ip:port"`
/// for IPv4, `"[ip]:port"` for IPv6.
pub fn format_address(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

fn split_host_port<'a>(rest: &'a str, original: &str) -> Result<(&'a str, u16), Error> {
    match rest.rfind(':') {
        Some(idx) => {
            let (host, port_str) = (&rest[..idx], &rest[idx + 1..]);
            let port = port_str
                .parse::<u16>()
                .map_err(|_| invalid(original, "bad port"))?;
            Ok((host, port))
        }
        None => Ok((rest, DEFAULT_PORT)),
    }
}

fn parse_optional_port(rest: &str, original: &str) -> Result<u16, Error> {
    if rest.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| invalid(original, "expected ':' before port"))?;
    rest.parse::<u16>()
        .map_err(|_| invalid(original, "bad port"))
}

fn validate_dns_name(host: &str, original: &str) -> Result<(), Error> {
    if host
        .split('.')
        .any(|label| label.is_empty() || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'))
    {
        return Err(invalid(original, "invalid dns name"));
    }
    Ok(())
}

fn invalid(target: &str, why: &str) -> Error {
    Error::msg(ErrorKind::Target, format!("invalid target {target:?}: {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_literal_gets_default_port() {
        let t = Target::parse("1.2.3.4").unwrap();
        assert_eq!(t.default_authority(), "1.2.3.4:443");
    }

    #[test]
    fn bracketed_ipv6_with_port() {
        let t = Target::parse("[::1]:50051").unwrap();
        assert_eq!(t.default_authority(), "[::1]:50051");
    }

    #[test]
    fn dns_target_with_scheme_and_port() {
        let t = Target::parse("dns:example.com:80").unwrap();
        match t {
            Target::Dns { host, port, .. } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 80);
            }
            _ => panic!("expected dns target"),
        }
    }

    #[test]
    fn dns_target_with_authority() {
        let t = Target::parse("dns://8.8.8.8/example.com").unwrap();
        match t {
            Target::Dns { authority, host, .. } => {
                assert_eq!(authority.as_deref(), Some("8.8.8.8"));
                assert_eq!(host, "example.com");
            }
            _ => panic!("expected dns target"),
        }
    }

    #[test]
    fn rejects_malformed_target() {
        assert!(Target::parse("dns://").is_err());
        assert!(Target::parse("").is_err());
    }
}
