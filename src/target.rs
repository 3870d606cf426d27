use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Default cap on the number of enumerated hosts; `--force` lifts it.
pub const MAX_HOSTS_DEFAULT: usize = 65536;

/// TLD suffixes the hostname heuristic recognizes even without letters
/// elsewhere in the token.
const KNOWN_TLDS: &[&str] = &[
    ".com", ".net", ".org", ".edu", ".gov", ".mil", ".cn", ".uk", ".jp", ".de", ".fr", ".ru",
    ".info", ".biz", ".name", ".mobi", ".io", ".ai",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid IPv6 address `{0}`")]
    InvalidIpv6(String),
    #[error("invalid CIDR prefix in `{0}` (expected 0-32)")]
    InvalidPrefix(String),
    #[error("invalid IP in CIDR `{0}`")]
    InvalidCidrIp(String),
    #[error("octet out of range in `{0}` (expected 0-255)")]
    OctetOutOfRange(String),
    #[error("unrecognized target `{0}`")]
    Unrecognized(String),
}

/// One fully classified target token. Classification runs once per token;
/// every later stage matches on the variant instead of re-scanning the
/// string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Cidr { base: Ipv4Addr, prefix: u8 },
    /// `a.b.c.d1-d2`, range normalized so `lo <= hi`.
    LastOctetRange { prefix: [u8; 3], lo: u8, hi: u8 },
    /// `a.b.c1-c2`; the fourth octet is swept 1..=254 per third octet.
    ThirdOctetRange { prefix: [u8; 2], lo: u8, hi: u8 },
    /// `a.b.c.x,y,z1-z2`; each item is a normalized sub-range.
    OctetList { prefix: [u8; 3], items: Vec<(u8, u8)> },
    /// Resolved by the caller through `resolve::forward`.
    Hostname(String),
}

/// Splits a comma-carrying CLI argument into independent target tokens when
/// every part stands on its own (a full address or a hostname). If any part
/// is a bare number the argument is a last-octet list and stays whole.
pub fn split_composite(arg: &str) -> Vec<String> {
    if !arg.contains(',') {
        return vec![arg.to_string()];
    }
    let standalone = arg.split(',').all(|p| {
        p.is_empty()
            || p.contains('.')
            || p.contains(':')
            || p.chars().any(|c| c.is_ascii_alphabetic())
    });
    if standalone {
        arg.split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![arg.to_string()]
    }
}

/// Heuristic hostname check, applied before the address grammar. Comma and
/// slash tokens are never hostnames, nor are valid IP literals.
fn looks_like_hostname(token: &str) -> bool {
    if token.is_empty() || token.contains(',') || token.contains('/') {
        return false;
    }
    if token.contains(':') && token.parse::<Ipv6Addr>().is_ok() {
        return false;
    }
    if token.parse::<Ipv4Addr>().is_ok() {
        return false;
    }
    if token.chars().any(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    if token.contains('-') {
        // Digits, dots and a dash form a numeric range, not a name.
        return !token.contains('.');
    }
    if token.bytes().filter(|b| *b == b'.').count() >= 2 {
        return true;
    }
    if KNOWN_TLDS.iter().any(|tld| token.ends_with(tld)) {
        return true;
    }
    token.eq_ignore_ascii_case("localhost")
}

/// Classifies one token, in the grammar's priority order.
pub fn classify(token: &str) -> Result<TargetSpec, ParseError> {
    if looks_like_hostname(token) {
        return Ok(TargetSpec::Hostname(token.to_string()));
    }
    if token.contains(':') {
        return token
            .parse::<Ipv6Addr>()
            .map(TargetSpec::V6)
            .map_err(|_| ParseError::InvalidIpv6(token.to_string()));
    }
    if let Some((ip_part, prefix_part)) = token.split_once('/') {
        let prefix = prefix_part
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| ParseError::InvalidPrefix(token.to_string()))?;
        let base = ip_part
            .parse::<Ipv4Addr>()
            .map_err(|_| ParseError::InvalidCidrIp(token.to_string()))?;
        return Ok(TargetSpec::Cidr { base, prefix });
    }
    if token.contains('-') && !token.contains(',') {
        if let Some(spec) = classify_range(token)? {
            return Ok(spec);
        }
    }
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() == 4 && parts[3].contains(',') {
        let prefix = [
            parse_octet(parts[0], token)?,
            parse_octet(parts[1], token)?,
            parse_octet(parts[2], token)?,
        ];
        let mut items = Vec::new();
        for piece in parts[3].split(',') {
            if piece.is_empty() {
                continue;
            }
            items.push(match piece.split_once('-') {
                Some((lo, hi)) => {
                    normalized(parse_octet(lo, token)?, parse_octet(hi, token)?)
                }
                None => {
                    let d = parse_octet(piece, token)?;
                    (d, d)
                }
            });
        }
        return Ok(TargetSpec::OctetList { prefix, items });
    }
    token
        .parse::<Ipv4Addr>()
        .map(TargetSpec::V4)
        .map_err(|_| ParseError::Unrecognized(token.to_string()))
}

/// The two dash sub-forms, mutually exclusive by segment count. Tokens that
/// carry a dash elsewhere fall through to the literal-address check.
fn classify_range(token: &str) -> Result<Option<TargetSpec>, ParseError> {
    let parts: Vec<&str> = token.split('.').collect();
    match parts.as_slice() {
        [a, b, c, last] if last.contains('-') => {
            let (lo, hi) = last
                .split_once('-')
                .ok_or_else(|| ParseError::Unrecognized(token.to_string()))?;
            let (lo, hi) = normalized(parse_octet(lo, token)?, parse_octet(hi, token)?);
            Ok(Some(TargetSpec::LastOctetRange {
                prefix: [
                    parse_octet(a, token)?,
                    parse_octet(b, token)?,
                    parse_octet(c, token)?,
                ],
                lo,
                hi,
            }))
        }
        [a, b, last] if last.contains('-') => {
            let (lo, hi) = last
                .split_once('-')
                .ok_or_else(|| ParseError::Unrecognized(token.to_string()))?;
            let (lo, hi) = normalized(parse_octet(lo, token)?, parse_octet(hi, token)?);
            Ok(Some(TargetSpec::ThirdOctetRange {
                prefix: [parse_octet(a, token)?, parse_octet(b, token)?],
                lo,
                hi,
            }))
        }
        _ => Ok(None),
    }
}

fn parse_octet(s: &str, token: &str) -> Result<u8, ParseError> {
    s.parse::<u8>()
        .map_err(|_| ParseError::OctetOutOfRange(token.to_string()))
}

fn normalized(lo: u8, hi: u8) -> (u8, u8) {
    if lo <= hi { (lo, hi) } else { (hi, lo) }
}

impl TargetSpec {
    /// Expands to concrete addresses in ascending order, stopping silently
    /// once `cap` addresses have been emitted. `Hostname` expands to
    /// nothing; the caller resolves it instead.
    pub fn expand(&self, cap: usize) -> Vec<IpAddr> {
        match self {
            TargetSpec::V4(ip) => vec![IpAddr::V4(*ip)],
            TargetSpec::V6(ip) => vec![IpAddr::V6(*ip)],
            TargetSpec::Cidr { base, prefix } => expand_cidr(*base, *prefix, cap),
            TargetSpec::LastOctetRange { prefix, lo, hi } => (*lo..=*hi)
                .take(cap)
                .map(|d| v4(prefix[0], prefix[1], prefix[2], d))
                .collect(),
            TargetSpec::ThirdOctetRange { prefix, lo, hi } => {
                let mut out = Vec::new();
                'sweep: for c in *lo..=*hi {
                    for d in 1..=254u8 {
                        if out.len() >= cap {
                            break 'sweep;
                        }
                        out.push(v4(prefix[0], prefix[1], c, d));
                    }
                }
                out
            }
            TargetSpec::OctetList { prefix, items } => {
                let mut out = Vec::new();
                'list: for (lo, hi) in items {
                    for d in *lo..=*hi {
                        if out.len() >= cap {
                            break 'list;
                        }
                        out.push(v4(prefix[0], prefix[1], prefix[2], d));
                    }
                }
                out
            }
            TargetSpec::Hostname(_) => Vec::new(),
        }
    }
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn expand_cidr(base: Ipv4Addr, prefix: u8, cap: usize) -> Vec<IpAddr> {
    let ip = u32::from(base);
    if prefix == 32 {
        return vec![IpAddr::V4(base)];
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = ip & mask;
    let broadcast = network | !mask;
    // /31 is point-to-point, both addresses are hosts.
    let (start, end) = if prefix == 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    };
    (start..=end)
        .take(cap)
        .map(|v| IpAddr::V4(Ipv4Addr::from(v)))
        .collect()
}
