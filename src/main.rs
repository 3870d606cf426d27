mod compress;
mod probe;
mod report;
mod resolve;
mod scheduler;
mod stats;
mod target;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use probe::{IcmpPinger, ProbeOptions, TransportInitError};
use report::{Console, RunSummary};
use resolve::FamilyFilter;
use scheduler::{RunState, Scheduler, SweepConfig};
use stats::StatsTable;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Concurrent ping sweeper for addresses, CIDR blocks, octet ranges and hostnames."
)]
struct CliArgs {
    /// Targets: address, CIDR block, octet range/list, or hostname
    #[clap(required = true, num_args = 1..)]
    targets: Vec<String>,

    /// Ping each target until interrupted
    #[clap(short = 't', long = "continuous", conflicts_with = "count")]
    continuous: bool,

    /// Echo requests to send per target
    #[clap(short = 'n', long = "count", default_value_t = 1,
           value_parser = clap::value_parser!(u64).range(1..))]
    count: u64,

    /// Reply timeout in milliseconds
    #[clap(short = 'w', long = "timeout", default_value_t = probe::DEFAULT_TIMEOUT_MS,
           value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Payload size in bytes
    #[clap(short = 'l', long = "size", default_value_t = probe::DEFAULT_PAYLOAD_SIZE)]
    payload_size: usize,

    /// Time to live
    #[clap(short = 'i', long = "ttl", default_value_t = probe::DEFAULT_TTL)]
    ttl: u8,

    /// Type of service (IPv4 only)
    #[clap(short = 'v', long = "tos", default_value_t = 0)]
    tos: u8,

    /// Set the don't-fragment flag (IPv4 only)
    #[clap(short = 'f', long = "dont-fragment")]
    dont_fragment: bool,

    /// Record route for this many hops (IPv4 only)
    #[clap(short = 'r', long = "record-route",
           value_parser = clap::value_parser!(u8).range(1..=probe::MAX_RECORD_ROUTE as i64))]
    record_route: Option<u8>,

    /// Timestamp this many hops (IPv4 only)
    #[clap(short = 's', long = "timestamp",
           value_parser = clap::value_parser!(u8).range(1..=probe::MAX_TIMESTAMP as i64))]
    timestamp: Option<u8>,

    /// Loose source route, comma-separated hosts (IPv4 only)
    #[clap(short = 'j', long = "loose-route", value_delimiter = ',')]
    loose_route: Vec<Ipv4Addr>,

    /// Strict source route, comma-separated hosts (IPv4 only)
    #[clap(short = 'k', long = "strict-route", value_delimiter = ',')]
    strict_route: Vec<Ipv4Addr>,

    /// Source address to probe from
    #[clap(short = 'S', long = "source")]
    source: Option<IpAddr>,

    /// Force IPv4
    #[clap(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Force IPv6
    #[clap(short = '6')]
    ipv6: bool,

    /// Resolve addresses to hostnames in output
    #[clap(short = 'a', long = "resolve")]
    resolve: bool,

    /// Number of worker threads
    #[clap(long, default_value_t = scheduler::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Allow more than the default cap of 65536 targets
    #[clap(long)]
    force: bool,

    /// Addresses to skip, comma-separated
    #[clap(long, value_delimiter = ',')]
    exclude: Vec<IpAddr>,
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(args) {
        Ok(summary) if summary.any_reply() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.is::<TransportInitError>() {
                ExitCode::from(3)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(args: CliArgs) -> Result<RunSummary> {
    if args.payload_size > probe::MAX_PAYLOAD_SIZE {
        bail!(
            "payload size {} exceeds the maximum of {} bytes",
            args.payload_size,
            probe::MAX_PAYLOAD_SIZE
        );
    }

    let family = if args.ipv6 {
        FamilyFilter::V6Only
    } else if args.ipv4 {
        FamilyFilter::V4Only
    } else {
        FamilyFilter::Any
    };

    let targets = build_targets(&args, family)?;
    println!("Targets: {}", targets.len());

    let opts = ProbeOptions {
        timeout: Duration::from_millis(args.timeout_ms),
        payload_size: args.payload_size,
        ttl: u32::from(args.ttl),
        tos: u32::from(args.tos),
        dont_fragment: args.dont_fragment,
        record_route: args.record_route.unwrap_or(0),
        timestamp: args.timestamp.unwrap_or(0),
        loose_source_route: args.loose_route.clone(),
        strict_source_route: args.strict_route.clone(),
        source: args.source,
    };
    let pinger = IcmpPinger::new(&targets, &opts)?;

    let state = Arc::new(RunState::new());
    install_console_handler(&state, args.continuous)?;

    let stats = StatsTable::new(targets.len());
    let console = Console::stdout();
    let cfg = SweepConfig {
        concurrency: args.concurrency,
        quota: if args.continuous { 0 } else { args.count },
        family,
        resolve_names: args.resolve,
        interval: scheduler::PING_INTERVAL,
    };
    Scheduler::new(&targets, &stats, &state, &console, &pinger, &opts, &cfg).run();

    Ok(report::print_final(&console, &targets, &stats))
}

/// Expands every CLI target argument into the flat address list, resolving
/// hostnames and dropping excluded addresses. Any malformed token aborts
/// the whole run.
fn build_targets(args: &CliArgs, family: FamilyFilter) -> Result<Vec<IpAddr>> {
    let cap = if args.force {
        usize::MAX
    } else {
        target::MAX_HOSTS_DEFAULT
    };
    let exclude: HashSet<IpAddr> = args.exclude.iter().copied().collect();

    let mut targets: Vec<IpAddr> = Vec::new();
    for arg in &args.targets {
        for token in target::split_composite(arg) {
            match target::classify(&token)? {
                target::TargetSpec::Hostname(name) => {
                    let resolved = resolve::forward(&name, family);
                    if resolved.is_empty() {
                        bail!("could not resolve `{name}`");
                    }
                    targets.extend(resolved.into_iter().filter(|a| !exclude.contains(a)));
                }
                spec => {
                    targets.extend(spec.expand(cap).into_iter().filter(|a| !exclude.contains(a)));
                }
            }
        }
    }

    if targets.is_empty() {
        bail!("no targets generated");
    }
    if !args.force && targets.len() > target::MAX_HOSTS_DEFAULT {
        bail!(
            "{} targets exceed the limit of {}; pass --force to override",
            targets.len(),
            target::MAX_HOSTS_DEFAULT
        );
    }
    Ok(targets)
}

/// Console-event wiring. In continuous mode the first Ctrl-C asks for an
/// interim snapshot, the second stops the run gracefully, a third aborts.
/// In bounded mode the first press already stops.
fn install_console_handler(state: &Arc<RunState>, continuous: bool) -> Result<()> {
    let state = Arc::clone(state);
    let presses = AtomicU32::new(0);
    ctrlc::set_handler(move || {
        match (continuous, presses.fetch_add(1, Ordering::AcqRel)) {
            (true, 0) => state.request_snapshot(),
            (true, 1) | (false, 0) => state.request_stop(),
            _ => std::process::exit(130),
        }
    })
    .context("failed to install the Ctrl-C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("sweeper").chain(argv.iter().copied()))
    }

    #[test]
    fn excluded_addresses_are_dropped_from_the_list() {
        let args = parse(&["10.0.0.1-4", "--exclude", "10.0.0.2,10.0.0.4"]);
        let targets = build_targets(&args, FamilyFilter::Any).unwrap();
        let shown: Vec<String> = targets.iter().map(|a| a.to_string()).collect();
        assert_eq!(shown, ["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn excluding_everything_leaves_no_targets() {
        let args = parse(&["192.168.0.9", "--exclude", "192.168.0.9"]);
        let err = build_targets(&args, FamilyFilter::Any).unwrap_err();
        assert!(err.to_string().contains("no targets"));
    }

    #[test]
    fn malformed_tokens_abort_enumeration() {
        let args = parse(&["10.0.0.1", "10.0.0.1-400"]);
        assert!(build_targets(&args, FamilyFilter::Any).is_err());
    }

    #[test]
    fn continuous_conflicts_with_count() {
        assert!(CliArgs::try_parse_from(["sweeper", "-t", "-n", "3", "10.0.0.1"]).is_err());
    }
}
