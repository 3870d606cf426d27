//! Console output: serialized per-probe lines, interim snapshots, and the
//! final statistics block.

use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::Mutex;

use comfy_table::Table;

use crate::compress;
use crate::probe::ProbeOutcome;
use crate::stats::StatsTable;

/// Shared output stream. Workers hold the lock only long enough to write
/// one outcome, so concurrent probes never interleave partial lines.
pub struct Console {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(writer),
        }
    }

    /// One line per probe, mirroring classic ping output, plus indented
    /// route/timestamp detail when the transport supplied any.
    pub fn outcome(
        &self,
        addr: IpAddr,
        name: Option<&str>,
        outcome: &ProbeOutcome,
        payload_size: usize,
    ) {
        let mut out = self.lock();
        let shown = match name {
            Some(host) => format!("{host} [{addr}]"),
            None => addr.to_string(),
        };
        if outcome.success {
            let _ = writeln!(
                out,
                "Reply from {shown}: bytes={payload_size} time={}ms TTL={}",
                outcome.rtt.as_millis(),
                outcome.reply_ttl
            );
            if !outcome.route_hops.is_empty() {
                let hops: Vec<String> =
                    outcome.route_hops.iter().map(|h| h.to_string()).collect();
                let _ = writeln!(out, "    route: {}", hops.join(" -> "));
            }
            if !outcome.timestamps.is_empty() {
                let stamps: Vec<String> =
                    outcome.timestamps.iter().map(|t| format!("{t}ms")).collect();
                let _ = writeln!(out, "    timestamps: {}", stamps.join(", "));
            }
        } else {
            let _ = writeln!(out, "Request timed out for {shown}");
        }
    }

    /// Interim totals on demand, without pausing the workers.
    pub fn snapshot(&self, sent: u64, received: u64) {
        let mut out = self.lock();
        let _ = writeln!(out, "\n--- interim statistics ---");
        let _ = writeln!(out, "Totals: sent={sent}, received={received}");
    }

    pub fn block(&self, text: &str) {
        let mut out = self.lock();
        let _ = writeln!(out, "{text}");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
        self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Final classification of the run; drives the process exit code.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub total_sent: u64,
    pub total_received: u64,
    pub reachable: Vec<IpAddr>,
    pub unreachable: Vec<IpAddr>,
}

impl RunSummary {
    pub fn any_reply(&self) -> bool {
        self.total_received > 0
    }
}

/// Prints the per-target table, the aggregate counters and the compressed
/// reachable/unreachable sets. Called only after every worker has joined,
/// so the counters are read at rest.
pub fn print_final(console: &Console, targets: &[IpAddr], stats: &StatsTable) -> RunSummary {
    let mut summary = RunSummary::default();
    let mut table = Table::new();
    table.set_header(["Target", "Sent", "Received", "Lost", "Loss"]);

    for (i, addr) in targets.iter().enumerate() {
        let sent = stats.sent(i);
        let received = stats.received(i);
        let lost = sent.saturating_sub(received);
        let pct = if sent > 0 {
            100.0 * lost as f64 / sent as f64
        } else {
            0.0
        };
        table.add_row([
            addr.to_string(),
            sent.to_string(),
            received.to_string(),
            lost.to_string(),
            format!("{pct:.1}%"),
        ]);
        summary.total_sent += sent;
        summary.total_received += received;
        if received > 0 {
            summary.reachable.push(*addr);
        } else {
            summary.unreachable.push(*addr);
        }
    }

    let lost = summary.total_sent.saturating_sub(summary.total_received);
    let pct = if summary.total_sent > 0 {
        100.0 * lost as f64 / summary.total_sent as f64
    } else {
        0.0
    };
    console.block(&format!("\n--- statistics ---\n{table}"));
    console.block(&format!(
        "Packets: sent={}, received={}, lost={} ({pct:.1}%)",
        summary.total_sent, summary.total_received, lost
    ));
    console.block(&format!(
        "\nReachable ({}): {}",
        summary.reachable.len(),
        compress::compress(&summary.reachable)
    ));
    console.block(&format!(
        "Unreachable ({}): {}",
        summary.unreachable.len(),
        compress::compress(&summary.unreachable)
    ));
    summary
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer so tests can read back what a `Console`
    /// wrote.
    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
