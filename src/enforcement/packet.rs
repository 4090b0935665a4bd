//! Minimal IP header parsing for intercepted packets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Destination address of a raw IPv4 or IPv6 packet.
///
/// Returns `None` for truncated packets and unknown IP versions.
pub fn destination(data: &[u8]) -> Option<IpAddr> {
    let first = *data.first()?;

    match first >> 4 {
        4 => {
            if data.len() < 20 {
                return None;
            }
            let octets: [u8; 4] = data[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let octets: [u8; 16] = data[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ipv4_packet, ipv6_packet};

    #[test]
    fn parses_ipv4_destination() {
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        assert_eq!(destination(&ipv4_packet(dst)), Some(IpAddr::V4(dst)));
    }

    #[test]
    fn parses_ipv6_destination() {
        let dst: Ipv6Addr = "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap();
        assert_eq!(destination(&ipv6_packet(dst)), Some(IpAddr::V6(dst)));
    }

    #[test]
    fn rejects_truncated_and_unknown() {
        assert_eq!(destination(&[]), None);
        assert_eq!(destination(&[0x45; 19]), None);
        assert_eq!(destination(&[0x60; 39]), None);
        assert_eq!(destination(&[0x20; 60]), None);
    }
}
