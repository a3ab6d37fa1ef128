//! Network helpers: CIDR parsing and trusted-proxy client IP resolution.

use std::net::IpAddr;

/// A parsed CIDR block. A bare address parses as a /32 (or /128) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub network: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    /// Whether the address falls inside this block. Mixed-family
    /// comparisons are always false.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(net) ^ u32::from(*ip);
                self.prefix == 0 || bits >> (32 - self.prefix.min(32) as u32) == 0
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u128::from(net) ^ u128::from(*ip);
                self.prefix == 0 || bits >> (128 - self.prefix.min(128) as u32) == 0
            }
            _ => false,
        }
    }
}

/// Parses `a.b.c.d/len`, `addr/len` for IPv6, or a bare address.
pub fn parse_cidr(value: &str) -> Result<Cidr, String> {
    let (addr_part, prefix_part) = match value.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (value, None),
    };

    let network: IpAddr = addr_part
        .parse()
        .map_err(|_| format!("invalid address '{}'", addr_part))?;

    let max = match network {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };

    let prefix = match prefix_part {
        Some(p) => p
            .parse::<u8>()
            .ok()
            .filter(|len| *len <= max)
            .ok_or_else(|| format!("invalid prefix length '{}'", p))?,
        None => max,
    };

    Ok(Cidr { network, prefix })
}

/// Whether any block in the list contains the address.
pub fn any_contains(blocks: &[Cidr], addr: &IpAddr) -> bool {
    blocks.iter().any(|b| b.contains(addr))
}

/// Resolves the real client address from the peer address and the
/// `X-Forwarded-For` chain.
///
/// The chain is only consulted when the peer itself is a trusted proxy.
/// Walking right-to-left, the first hop not in the trusted set is the
/// client; if every hop is trusted the leftmost entry wins.
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    forwarded_for: Option<&str>,
    trusted: &[Cidr],
) -> Option<IpAddr> {
    let peer = peer?;
    if trusted.is_empty() || !any_contains(trusted, &peer) {
        return Some(peer);
    }

    let hops: Vec<IpAddr> = forwarded_for
        .unwrap_or("")
        .split(',')
        .filter_map(|h| h.trim().parse().ok())
        .collect();

    for hop in hops.iter().rev() {
        if !any_contains(trusted, hop) {
            return Some(*hop);
        }
    }
    hops.first().copied().or(Some(peer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        parse_cidr(s).unwrap()
    }

    #[test]
    fn cidr_containment() {
        let block = cidr("10.0.0.0/8");
        assert!(block.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!block.contains(&"11.0.0.1".parse().unwrap()));

        let single = cidr("192.168.1.5");
        assert!(single.contains(&"192.168.1.5".parse().unwrap()));
        assert!(!single.contains(&"192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("not-an-ip").is_err());
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_chain() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        let got = resolve_client_ip(Some(peer), Some("198.51.100.1"), &trusted);
        assert_eq!(got, Some(peer));
    }

    #[test]
    fn trusted_peer_unwraps_to_first_untrusted_hop() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let got = resolve_client_ip(Some(peer), Some("198.51.100.1, 10.0.0.2"), &trusted);
        assert_eq!(got, Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn fully_trusted_chain_uses_leftmost() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let got = resolve_client_ip(Some(peer), Some("10.9.9.9, 10.0.0.2"), &trusted);
        assert_eq!(got, Some("10.9.9.9".parse().unwrap()));
    }
}
