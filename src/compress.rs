//! Compressed range notation for classified address sets.

use std::net::{IpAddr, Ipv4Addr};

/// Marker for an empty set.
pub const EMPTY_SET: &str = "(none)";

/// Renders a multiset of addresses as comma-joined ranges: IPv4 addresses
/// are sorted and maximal consecutive runs are merged (`a.b.c.1-10` within
/// one /24, full dotted form across /24 boundaries); IPv6 addresses are
/// appended verbatim, never merged.
pub fn compress(addrs: &[IpAddr]) -> String {
    let mut v4: Vec<u32> = Vec::new();
    let mut v6: Vec<String> = Vec::new();
    for addr in addrs {
        match addr {
            IpAddr::V4(ip) => v4.push(u32::from(*ip)),
            IpAddr::V6(ip) => v6.push(ip.to_string()),
        }
    }
    v4.sort_unstable();

    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < v4.len() {
        let start = v4[i];
        let mut j = i;
        while j + 1 < v4.len() && v4[j].checked_add(1) == Some(v4[j + 1]) {
            j += 1;
        }
        let end = v4[j];
        if start == end {
            parts.push(dotted(start));
        } else if start & 0xffff_ff00 == end & 0xffff_ff00 {
            parts.push(format!("{}-{}", dotted(start), end & 0xff));
        } else {
            parts.push(format!("{}-{}", dotted(start), dotted(end)));
        }
        i = j + 1;
    }
    parts.extend(v6);

    if parts.is_empty() {
        EMPTY_SET.to_string()
    } else {
        parts.join(", ")
    }
}

fn dotted(value: u32) -> String {
    Ipv4Addr::from(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(addrs: &[&str]) -> Vec<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn merges_consecutive_runs_within_a_slash_24() {
        let input = set(&["192.168.1.1", "192.168.1.2", "192.168.1.3", "192.168.1.5"]);
        assert_eq!(compress(&input), "192.168.1.1-3, 192.168.1.5");
    }

    #[test]
    fn empty_input_yields_the_marker() {
        assert_eq!(compress(&[]), EMPTY_SET);
    }

    #[test]
    fn run_crossing_a_slash_24_uses_the_full_form() {
        let input = set(&["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
        assert_eq!(compress(&input), "10.0.0.254-10.0.1.1");
    }

    #[test]
    fn input_order_does_not_matter() {
        let input = set(&["10.0.0.3", "10.0.0.1", "10.0.0.2"]);
        assert_eq!(compress(&input), "10.0.0.1-3");
    }

    #[test]
    fn duplicates_break_runs_and_are_kept() {
        let input = set(&["10.0.0.1", "10.0.0.1", "10.0.0.2"]);
        assert_eq!(compress(&input), "10.0.0.1, 10.0.0.1-2");
    }

    #[test]
    fn ipv6_is_appended_uncompressed() {
        let input = set(&["2001:db8::2", "10.0.0.1", "2001:db8::1", "10.0.0.2"]);
        assert_eq!(compress(&input), "10.0.0.1-2, 2001:db8::2, 2001:db8::1");
    }

    #[test]
    fn singletons_stay_literal() {
        let input = set(&["10.0.0.1", "10.0.0.5"]);
        assert_eq!(compress(&input), "10.0.0.1, 10.0.0.5");
    }
}
