//! Forward and reverse name resolution with a bounded wait. A lookup that
//! outlives the timeout yields nothing; the stray thread finishes on its
//! own and its result is dropped.

use std::net::IpAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use dns_lookup::{lookup_addr, lookup_host};

pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Address family restriction from `-4` / `-6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyFilter {
    Any,
    V4Only,
    V6Only,
}

impl FamilyFilter {
    pub fn admits(self, addr: &IpAddr) -> bool {
        match self {
            FamilyFilter::Any => true,
            FamilyFilter::V4Only => addr.is_ipv4(),
            FamilyFilter::V6Only => addr.is_ipv6(),
        }
    }
}

/// Resolves a hostname to every address of the admitted family. Failure
/// and timeout both yield an empty list; the caller decides whether that
/// is fatal.
pub fn forward(host: &str, family: FamilyFilter) -> Vec<IpAddr> {
    let host = host.to_string();
    bounded(RESOLVE_TIMEOUT, move || {
        lookup_host(&host).unwrap_or_default()
    })
    .unwrap_or_default()
    .into_iter()
    .filter(|addr| family.admits(addr))
    .collect()
}

/// Reverse lookup for display; `None` on failure or timeout.
pub fn reverse(addr: IpAddr) -> Option<String> {
    bounded(RESOLVE_TIMEOUT, move || lookup_addr(&addr).ok()).flatten()
}

fn bounded<T: Send + 'static>(
    timeout: Duration,
    lookup: impl FnOnce() -> T + Send + 'static,
) -> Option<T> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(lookup());
    });
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_filter_admits_matching_addresses() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(FamilyFilter::Any.admits(&v4) && FamilyFilter::Any.admits(&v6));
        assert!(FamilyFilter::V4Only.admits(&v4) && !FamilyFilter::V4Only.admits(&v6));
        assert!(FamilyFilter::V6Only.admits(&v6) && !FamilyFilter::V6Only.admits(&v4));
    }

    #[test]
    fn bounded_returns_a_prompt_result() {
        assert_eq!(bounded(Duration::from_secs(1), || 7), Some(7));
    }

    #[test]
    fn bounded_gives_up_after_the_timeout() {
        let slow = || {
            thread::sleep(Duration::from_millis(500));
            7
        };
        assert_eq!(bounded(Duration::from_millis(20), slow), None);
    }
}
