//! Per-attempt connection metrics and the waterfall rendering.
//!
//! The dialer and transport fill in one [`ConnMetrics`] per attempt; the
//! response pipeline wraps the body in a wall-clock reader that records the
//! first and last read. At the end of the request an ASCII waterfall is
//! rendered to stderr, one line per phase with a `█` span proportional to
//! its share of the total.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Facts about the negotiated TLS session.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub version: Option<String>,
    pub cipher: Option<String>,
    pub alpn: Option<String>,
    pub resumed: bool,
    pub peer_cert_summary: Option<String>,
}

/// Timings for a single request attempt.
///
/// Invariant: phase start times are monotonic (dns <= tcp <= tls <= ttfb),
/// and `body_last >= body_first` when both are set.
#[derive(Debug, Clone, Default)]
pub struct ConnMetrics {
    pub dns_start: Option<Instant>,
    pub dns_duration: Option<Duration>,
    pub dns_host: Option<String>,
    pub dns_addrs: Vec<std::net::IpAddr>,

    pub tcp_start: Option<Instant>,
    pub tcp_duration: Option<Duration>,

    pub tls_start: Option<Instant>,
    pub tls_duration: Option<Duration>,
    pub tls: Option<TlsInfo>,

    /// Connection was reused from a previous attempt within this invocation.
    pub reused: bool,

    pub ttfb_start: Option<Instant>,
    pub ttfb_duration: Option<Duration>,

    pub body_first_read: Option<Instant>,
    pub body_last_read: Option<Instant>,
}

impl ConnMetrics {
    pub fn body_duration(&self) -> Option<Duration> {
        match (self.body_first_read, self.body_last_read) {
            (Some(first), Some(last)) => Some(last.duration_since(first)),
            _ => None,
        }
    }

    /// Render the waterfall to `out` (normally stderr).
    pub fn render_waterfall(&self, out: &mut impl std::io::Write, color: bool) -> std::io::Result<()> {
        let phases = self.phases();
        let total: Duration = phases.iter().map(|(_, d)| *d).sum();
        if total.is_zero() {
            return Ok(());
        }

        // 40 columns of bar for the whole request; each phase's bar offset
        // mirrors its position within the total.
        const WIDTH: f64 = 40.0;
        let mut offset: f64 = 0.0;
        let mut buf = String::new();
        writeln!(buf).ok();
        for (i, (name, dur)) in phases.iter().enumerate() {
            let share = dur.as_secs_f64() / total.as_secs_f64();
            let cols = ((share * WIDTH).round() as usize).max(1);
            let pad = offset.round() as usize;
            offset += share * WIDTH;

            let bar: String = "█".repeat(cols);
            let bar = if color {
                format!("\x1b[3{}m{}\x1b[0m", (i % 6) + 1, bar)
            } else {
                bar
            };
            writeln!(
                buf,
                "{:<8} {:>9} {}{}",
                name,
                format_duration(*dur),
                " ".repeat(pad),
                bar
            )
            .ok();
        }
        writeln!(buf, "{:<8} {:>9}", "Total", format_duration(total)).ok();
        out.write_all(buf.as_bytes())
    }

    fn phases(&self) -> Vec<(&'static str, Duration)> {
        let mut phases = Vec::with_capacity(5);
        // A reused connection spent nothing on DNS/TCP/TLS this attempt.
        if !self.reused {
            if let Some(d) = self.dns_duration {
                phases.push(("DNS", d));
            }
            if let Some(d) = self.tcp_duration {
                phases.push(("TCP", d));
            }
            if let Some(d) = self.tls_duration {
                phases.push(("TLS", d));
            }
        }
        if let Some(d) = self.ttfb_duration {
            phases.push(("TTFB", d));
        }
        if let Some(d) = self.body_duration() {
            phases.push(("Body", d));
        }
        phases
    }
}

/// Human duration: sub-millisecond in µs, sub-second in ms, else seconds.
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.1}ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}
