//! Concurrent probe scheduling: a fixed pool of worker threads round-robins
//! over the shared target list, coordinating only through atomics and the
//! console lock.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::probe::{Pinger, ProbeOptions, ProbeOutcome};
use crate::report::Console;
use crate::resolve::{self, FamilyFilter};
use crate::stats::StatsTable;

pub const DEFAULT_CONCURRENCY: usize = 100;
pub const PING_INTERVAL: Duration = Duration::from_millis(1000);
const ADMISSION_BACKOFF: Duration = Duration::from_millis(10);
const SNAPSHOT_POLL: Duration = Duration::from_millis(200);

/// Run-wide control flags behind a narrow request interface. The console
/// handler talks to this; workers and the driver poll it cooperatively.
#[derive(Debug, Default)]
pub struct RunState {
    stop: AtomicBool,
    snapshot: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_snapshot(&self) {
        self.snapshot.store(true, Ordering::Release);
    }

    /// Consumes a pending snapshot request, if any.
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub concurrency: usize,
    /// Echo requests admitted per target; 0 probes until stopped.
    pub quota: u64,
    pub family: FamilyFilter,
    pub resolve_names: bool,
    pub interval: Duration,
}

pub struct Scheduler<'a, P> {
    targets: &'a [IpAddr],
    stats: &'a StatsTable,
    state: &'a RunState,
    console: &'a Console,
    pinger: &'a P,
    opts: &'a ProbeOptions,
    cfg: &'a SweepConfig,
    rr: AtomicUsize,
    /// Targets whose quota is not yet fully admitted. Reaches zero exactly
    /// when the sweep is done, so workers check one integer instead of
    /// rescanning the whole table.
    remaining: AtomicUsize,
}

impl<'a, P: Pinger + Sync> Scheduler<'a, P> {
    pub fn new(
        targets: &'a [IpAddr],
        stats: &'a StatsTable,
        state: &'a RunState,
        console: &'a Console,
        pinger: &'a P,
        opts: &'a ProbeOptions,
        cfg: &'a SweepConfig,
    ) -> Self {
        debug_assert!(!targets.is_empty());
        debug_assert_eq!(targets.len(), stats.len());
        Self {
            targets,
            stats,
            state,
            console,
            pinger,
            opts,
            cfg,
            rr: AtomicUsize::new(0),
            remaining: AtomicUsize::new(targets.len()),
        }
    }

    /// Runs the sweep to completion. Workers probe round-robin while the
    /// calling thread serves snapshot requests; the scope joins everything
    /// before returning, so the caller reads the stats at rest.
    pub fn run(&self) {
        let workers = self.cfg.concurrency.max(1).min(self.targets.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker());
            }
            while !self.state.stop_requested() {
                if self.state.take_snapshot_request() {
                    let (sent, received) = self.stats.totals();
                    self.console.snapshot(sent, received);
                }
                thread::sleep(SNAPSHOT_POLL);
            }
        });
    }

    fn worker(&self) {
        let n = self.targets.len();
        while !self.state.stop_requested() {
            let index = self.rr.fetch_add(1, Ordering::Relaxed) % n;

            if self.cfg.quota > 0 {
                match self.stats.try_reserve(index, self.cfg.quota) {
                    Some(admitted) if admitted == self.cfg.quota => {
                        // This reservation filled the target.
                        self.remaining.fetch_sub(1, Ordering::AcqRel);
                    }
                    Some(_) => {}
                    None => {
                        if self.all_admitted() {
                            self.state.request_stop();
                            break;
                        }
                        thread::sleep(ADMISSION_BACKOFF);
                        continue;
                    }
                }
            } else {
                self.stats.record_sent(index);
            }

            let addr = self.targets[index];
            let outcome = if self.cfg.family.admits(&addr) {
                self.pinger.probe(addr, self.opts)
            } else {
                // A forced family suppresses probing the other one; the
                // draw still counts as sent and shows up as a loss.
                ProbeOutcome::lost()
            };
            if outcome.success {
                self.stats.record_received(index);
            }

            let name = if self.cfg.resolve_names {
                resolve::reverse(addr)
            } else {
                None
            };
            self.console
                .outcome(addr, name.as_deref(), &outcome, self.opts.payload_size);

            if self.cfg.quota > 0 && self.all_admitted() {
                self.state.request_stop();
                break;
            }
            thread::sleep(self.cfg.interval);
        }
    }

    fn all_admitted(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::SharedBuf;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    /// Replies for every address except the ones marked down.
    struct MockPinger {
        down: HashSet<IpAddr>,
    }

    impl MockPinger {
        fn all_up() -> Self {
            Self {
                down: HashSet::new(),
            }
        }
    }

    impl Pinger for MockPinger {
        fn probe(&self, addr: IpAddr, _opts: &ProbeOptions) -> ProbeOutcome {
            if self.down.contains(&addr) {
                ProbeOutcome::lost()
            } else {
                ProbeOutcome {
                    success: true,
                    rtt: Duration::from_millis(1),
                    reply_ttl: 64,
                    ..ProbeOutcome::default()
                }
            }
        }
    }

    fn targets(n: u8) -> Vec<IpAddr> {
        (1..=n)
            .map(|d| IpAddr::V4(Ipv4Addr::new(10, 0, 0, d)))
            .collect()
    }

    fn config(quota: u64, concurrency: usize) -> SweepConfig {
        SweepConfig {
            concurrency,
            quota,
            family: FamilyFilter::Any,
            resolve_names: false,
            interval: Duration::from_millis(1),
        }
    }

    fn sweep(
        targets: &[IpAddr],
        cfg: &SweepConfig,
        pinger: &MockPinger,
        state: &RunState,
    ) -> StatsTable {
        let stats = StatsTable::new(targets.len());
        let console = Console::with_writer(Box::new(SharedBuf::default()));
        let opts = ProbeOptions::default();
        Scheduler::new(targets, &stats, state, &console, pinger, &opts, cfg).run();
        stats
    }

    #[test]
    fn bounded_run_admits_exactly_the_quota_per_target() {
        let targets = targets(4);
        let cfg = config(3, 2);
        let pinger = MockPinger::all_up();
        let state = RunState::new();
        let stats = sweep(&targets, &cfg, &pinger, &state);
        for i in 0..targets.len() {
            assert_eq!(stats.sent(i), 3, "target {i}");
            assert_eq!(stats.received(i), 3, "target {i}");
        }
        assert!(state.stop_requested());
    }

    #[test]
    fn quota_holds_with_more_workers_than_targets_would_suggest() {
        let targets = targets(2);
        let cfg = config(5, 64);
        let pinger = MockPinger::all_up();
        let state = RunState::new();
        let stats = sweep(&targets, &cfg, &pinger, &state);
        assert_eq!(stats.totals(), (10, 10));
    }

    #[test]
    fn down_targets_record_losses_only() {
        let targets = targets(3);
        let pinger = MockPinger {
            down: [targets[1]].into_iter().collect(),
        };
        let cfg = config(2, 3);
        let state = RunState::new();
        let stats = sweep(&targets, &cfg, &pinger, &state);
        assert_eq!((stats.sent(1), stats.received(1)), (2, 0));
        assert_eq!((stats.sent(0), stats.received(0)), (2, 2));
    }

    #[test]
    fn forced_family_suppresses_the_other_family() {
        let mut targets = targets(1);
        targets.push("2001:db8::1".parse().unwrap());
        let cfg = SweepConfig {
            family: FamilyFilter::V4Only,
            ..config(2, 2)
        };
        let pinger = MockPinger::all_up();
        let state = RunState::new();
        let stats = sweep(&targets, &cfg, &pinger, &state);
        // The v6 target is still drawn and counted, but never probed.
        assert_eq!((stats.sent(1), stats.received(1)), (2, 0));
        assert_eq!((stats.sent(0), stats.received(0)), (2, 2));
    }

    #[test]
    fn external_stop_ends_an_unbounded_run_promptly() {
        let targets = targets(2);
        let cfg = config(0, 2);
        let pinger = MockPinger::all_up();
        let state = RunState::new();
        let started = Instant::now();
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                state.request_stop();
            });
            let stats = sweep(&targets, &cfg, &pinger, &state);
            let (sent, _) = stats.totals();
            assert!(sent > 0);
        });
        // One snapshot poll plus one worker iteration, with headroom.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn snapshot_request_is_consumed_once() {
        let state = RunState::new();
        assert!(!state.take_snapshot_request());
        state.request_snapshot();
        assert!(state.take_snapshot_request());
        assert!(!state.take_snapshot_request());
    }
}
