//! Discovery of the hub's own reachable addresses

use crate::error::{AgentError, AgentResult};
use ipnet::IpNet;
use meridian_proto::{LabelSet, Location};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::debug;

pub const TYPE_LABEL: &str = "type";
pub const PUBLIC: &str = "public";
pub const PRIVATE: &str = "private";

/// Ranges not routable from the internet
const PRIVATE_NETS: [&str; 6] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
    "fc00::/7",
    "fe80::/10",
];

/// Well-known resolvers used to pick the outbound interface. Connecting a
/// UDP socket sends nothing.
const ROUTE_TARGET_V4: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
const ROUTE_TARGET_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    53,
);

#[derive(Debug, Clone, Default)]
pub struct LocationConfig {
    /// Port the hub listener accepts connections on
    pub port: u16,
    /// Addresses reachable from outside, e.g. a load balancer (`ip` or `ip:port`)
    pub public_addrs: Vec<String>,
    /// Keep only locations whose labels match
    pub filter: Option<LabelSet>,
}

/// `public` or `private`; `None` for addresses that are never advertised
pub fn classify(ip: IpAddr) -> Option<&'static str> {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return None;
    }
    let private = PRIVATE_NETS
        .iter()
        .filter_map(|net| net.parse::<IpNet>().ok())
        .any(|net| net.contains(&ip));
    Some(if private { PRIVATE } else { PUBLIC })
}

/// Local addresses of the interfaces used for outbound traffic
pub fn discover_local_addrs() -> Vec<IpAddr> {
    let mut found = Vec::new();
    for (bind, target) in [("0.0.0.0:0", ROUTE_TARGET_V4), ("[::]:0", ROUTE_TARGET_V6)] {
        let local = UdpSocket::bind(bind).and_then(|socket| {
            socket.connect(target)?;
            socket.local_addr()
        });
        match local {
            Ok(addr) => found.push(addr.ip()),
            Err(e) => debug!(target = %target, error = %e, "No route for address family"),
        }
    }
    found
}

/// Group candidate addresses into labelled locations.
///
/// Configured public addresses come first, then discovered ones; duplicates and
/// unadvertisable addresses are dropped.
pub fn build_locations(
    config: &LocationConfig,
    discovered: &[IpAddr],
) -> AgentResult<Vec<Location>> {
    let mut public: Vec<String> = Vec::new();
    let mut private: Vec<String> = Vec::new();

    let push = |list: &mut Vec<String>, addr: String| {
        if !list.contains(&addr) {
            list.push(addr);
        }
    };

    for raw in &config.public_addrs {
        let addr = parse_addr(raw.trim(), config.port)?;
        push(&mut public, addr.to_string());
    }

    for ip in discovered {
        let addr = SocketAddr::new(*ip, config.port).to_string();
        match classify(*ip) {
            Some(PUBLIC) => push(&mut public, addr),
            Some(_) => push(&mut private, addr),
            None => {}
        }
    }

    let locations = [(PUBLIC, public), (PRIVATE, private)]
        .into_iter()
        .filter(|(_, addresses)| !addresses.is_empty())
        .map(|(kind, addresses)| Location {
            labels: LabelSet::from_pairs([(TYPE_LABEL, kind)]),
            addresses,
        })
        .filter(|loc| {
            config
                .filter
                .as_ref()
                .map_or(true, |filter| loc.labels.matches(filter))
        })
        .collect();
    Ok(locations)
}

/// Inspect the host and build its locations
pub fn learn_locations(config: &LocationConfig) -> AgentResult<Vec<Location>> {
    let discovered = discover_local_addrs();
    let locations = build_locations(config, &discovered)?;
    if locations.is_empty() {
        return Err(AgentError::InvalidConfig(
            "no reachable addresses match the location filter".to_string(),
        ));
    }
    Ok(locations)
}

fn parse_addr(raw: &str, default_port: u16) -> AgentResult<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| AgentError::InvalidConfig(format!("invalid public address: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(ip("10.1.2.3")), Some(PRIVATE));
        assert_eq!(classify(ip("192.168.1.10")), Some(PRIVATE));
        assert_eq!(classify(ip("203.0.113.9")), Some(PUBLIC));
        assert_eq!(classify(ip("fd00::1")), Some(PRIVATE));
        assert_eq!(classify(ip("2001:db8::1")), Some(PUBLIC));
        assert_eq!(classify(ip("127.0.0.1")), None);
        assert_eq!(classify(ip("::")), None);
    }

    #[test]
    fn test_build_groups_by_type() {
        let config = LocationConfig {
            port: 443,
            public_addrs: vec!["198.51.100.4".into(), "198.51.100.5:8443".into()],
            filter: None,
        };
        let locations =
            build_locations(&config, &[ip("10.0.0.7"), ip("198.51.100.4"), ip("127.0.0.1")])
                .unwrap();

        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].labels.get(TYPE_LABEL), Some(PUBLIC));
        assert_eq!(
            locations[0].addresses,
            vec!["198.51.100.4:443", "198.51.100.5:8443"]
        );
        assert_eq!(locations[1].labels.get(TYPE_LABEL), Some(PRIVATE));
        assert_eq!(locations[1].addresses, vec!["10.0.0.7:443"]);
    }

    #[test]
    fn test_filter_by_labels() {
        let config = LocationConfig {
            port: 443,
            public_addrs: vec![],
            filter: Some(LabelSet::from_pairs([(TYPE_LABEL, PRIVATE)])),
        };
        let locations = build_locations(&config, &[ip("10.0.0.7"), ip("203.0.113.1")]).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].addresses, vec!["10.0.0.7:443"]);
    }

    #[test]
    fn test_rejects_bad_public_address() {
        let config = LocationConfig {
            port: 443,
            public_addrs: vec!["not-an-ip".into()],
            filter: None,
        };
        assert!(build_locations(&config, &[]).is_err());
    }
}
