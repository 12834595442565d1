//! Canonical peer endpoints.

use crate::error::Error;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// A canonical peer endpoint: an IPv6 address and a port.
///
/// IPv4 endpoints are stored in their IPv6-mapped form (`::ffff:a.b.c.d`) so
/// equality and deduplication behave identically regardless of which textual
/// or wire form produced the value. A port of zero means "unspecified" and is
/// omitted from the textual form.
///
/// The textual forms are `host`, `host:port`, and `[v6]:port`:
///
/// ```
/// use bitcoin_network_channel::Authority;
///
/// let v4: Authority = "1.2.3.4:8333".parse()?;
/// assert_eq!(v4.to_string(), "1.2.3.4:8333");
///
/// let v6: Authority = "[2001:db8::1]:8333".parse()?;
/// assert_eq!(v6.to_string(), "[2001:db8::1]:8333");
/// # Ok::<(), bitcoin_network_channel::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Authority {
    ip: Ipv6Addr,
    port: u16,
}

impl Authority {
    /// Create an authority from an address and port, mapping IPv4 into IPv6.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Authority { ip, port }
    }

    /// The unspecified authority, `[::]:0`.
    pub fn unspecified() -> Self {
        Authority {
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// The canonical (IPv6 or IPv6-mapped IPv4) address.
    pub fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    /// The port, zero when unspecified.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether both address and port are unspecified.
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }

    /// Whether this entry matches `other` for filtering purposes.
    ///
    /// A filter entry with port zero matches every port on its address.
    pub fn matches(&self, other: &Authority) -> bool {
        self.ip == other.ip && (self.port == 0 || self.port == other.port)
    }

    /// A connectable socket address, preferring the IPv4 form when mapped.
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, self.port)),
            None => SocketAddr::V6(SocketAddrV6::new(self.ip, self.port, 0, 0)),
        }
    }

    /// Convert into the wire address record with the given service flags.
    pub fn to_network_address(&self, services: ServiceFlags) -> Address {
        Address {
            services,
            address: self.ip.segments(),
            port: self.port,
        }
    }

    /// Build an authority from a wire address record.
    pub fn from_network_address(address: &Address) -> Self {
        Authority {
            ip: Ipv6Addr::from(address.address),
            port: address.port,
        }
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Authority::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => write!(f, "{v4}")?,
            None => write!(f, "[{}]", self.ip)?,
        }
        if self.port > 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

impl FromStr for Authority {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = text.strip_prefix('[') {
            // Bracketed IPv6, optionally followed by a port.
            let (host, tail) = rest.split_once(']').ok_or(Error::InvalidAuthority)?;
            let ip = host
                .parse::<Ipv6Addr>()
                .map_err(|_| Error::InvalidAuthority)?;
            let port = match tail {
                "" => 0,
                port => parse_port(port.strip_prefix(':').ok_or(Error::InvalidAuthority)?)?,
            };
            return Ok(Authority { ip, port });
        }

        // A bare IPv6 host cannot carry a port; its colons are its own.
        if let Ok(ip) = text.parse::<Ipv6Addr>() {
            return Ok(Authority { ip, port: 0 });
        }

        match text.split_once(':') {
            Some((host, port)) => {
                let ip = host
                    .parse::<Ipv4Addr>()
                    .map_err(|_| Error::InvalidAuthority)?;
                Ok(Authority::new(IpAddr::V4(ip), parse_port(port)?))
            }
            None => {
                let ip = text
                    .parse::<Ipv4Addr>()
                    .map_err(|_| Error::InvalidAuthority)?;
                Ok(Authority::new(IpAddr::V4(ip), 0))
            }
        }
    }
}

fn parse_port(text: &str) -> Result<u16, Error> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAuthority);
    }
    text.parse::<u16>().map_err(|_| Error::InvalidAuthority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_with_port() {
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(authority.ip(), "::ffff:1.2.3.4".parse::<Ipv6Addr>().unwrap());
        assert_eq!(authority.port(), 8333);
        assert_eq!(authority.to_string(), "1.2.3.4:8333");
    }

    #[test]
    fn test_parse_ipv4_without_port() {
        let authority: Authority = "10.0.0.1".parse().unwrap();
        assert_eq!(authority.port(), 0);
        assert_eq!(authority.to_string(), "10.0.0.1");
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let authority: Authority = "[2001:db8::1]:8333".parse().unwrap();
        assert_eq!(authority.ip(), "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(authority.port(), 8333);
        assert_eq!(authority.to_string(), "[2001:db8::1]:8333");
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let authority: Authority = "2001:db8::2".parse().unwrap();
        assert_eq!(authority.port(), 0);
        assert_eq!(authority.to_string(), "[2001:db8::2]");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            "not-an-endpoint".parse::<Authority>(),
            Err(Error::InvalidAuthority)
        );
        assert_eq!("1.2.3.4:".parse::<Authority>(), Err(Error::InvalidAuthority));
        assert_eq!(
            "1.2.3.4:70000".parse::<Authority>(),
            Err(Error::InvalidAuthority)
        );
        assert_eq!(
            "[2001:db8::1]8333".parse::<Authority>(),
            Err(Error::InvalidAuthority)
        );
        assert_eq!("".parse::<Authority>(), Err(Error::InvalidAuthority));
    }

    #[test]
    fn test_round_trip_through_text() {
        for text in ["1.2.3.4:8333", "10.0.0.1", "[2001:db8::1]:8333", "[::1]"] {
            let authority: Authority = text.parse().unwrap();
            let again: Authority = authority.to_string().parse().unwrap();
            assert_eq!(authority, again);
            assert_eq!(again.to_string(), text);
        }
    }

    #[test]
    fn test_equality_ignores_textual_form() {
        let mapped: Authority = "[::ffff:1.2.3.4]:8333".parse().unwrap();
        let dotted: Authority = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(mapped, dotted);
    }

    #[test]
    fn test_network_address_round_trip() {
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();
        let address = authority.to_network_address(ServiceFlags::NETWORK);
        assert_eq!(address.port, 8333);
        assert_eq!(Authority::from_network_address(&address), authority);
    }

    #[test]
    fn test_port_wildcard_matching() {
        let filter: Authority = "1.2.3.4".parse().unwrap();
        let exact: Authority = "1.2.3.4:8333".parse().unwrap();
        let other: Authority = "4.3.2.1:8333".parse().unwrap();
        assert!(filter.matches(&exact));
        assert!(exact.matches(&exact));
        assert!(!exact.matches(&filter));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_socket_addr_prefers_ipv4_when_mapped() {
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();
        assert!(matches!(authority.to_socket_addr(), SocketAddr::V4(_)));

        let authority: Authority = "[2001:db8::1]:8333".parse().unwrap();
        assert!(matches!(authority.to_socket_addr(), SocketAddr::V6(_)));
    }
}
