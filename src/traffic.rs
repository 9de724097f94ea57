use std::path::PathBuf;
use std::time::Instant;

use crate::error::{MonitorError, MonitorResult};
use crate::network::TrafficSample;

/// Cumulative byte counters since boot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Source of OS-level interface counters
pub trait TrafficCounter: Send {
    fn read_totals(&mut self) -> MonitorResult<TrafficTotals>;
}

/// Reads `/proc/net/dev`, summing every interface except loopback, or only
/// the named one.
pub struct ProcNetDevCounter {
    path: PathBuf,
    interface: Option<String>,
}

impl ProcNetDevCounter {
    pub fn new(interface: Option<String>) -> Self {
        Self {
            path: PathBuf::from("/proc/net/dev"),
            interface,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>, interface: Option<String>) -> Self {
        Self {
            path: path.into(),
            interface,
        }
    }
}

impl TrafficCounter for ProcNetDevCounter {
    fn read_totals(&mut self) -> MonitorResult<TrafficTotals> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            MonitorError::CounterUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        parse_proc_net_dev(&text, self.interface.as_deref())
    }
}

pub fn parse_proc_net_dev(text: &str, interface: Option<&str>) -> MonitorResult<TrafficTotals> {
    let mut totals = TrafficTotals::default();
    let mut matched = false;

    // First two lines are headers
    for line in text.lines().skip(2) {
        let (name, counters) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let name = name.trim();
        let selected = match interface {
            Some(wanted) => name == wanted,
            None => name != "lo",
        };
        if !selected {
            continue;
        }

        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(MonitorError::Parse(format!(
                "interface {} has {} counters",
                name,
                fields.len()
            )));
        }
        let rx: u64 = fields[0]
            .parse()
            .map_err(|_| MonitorError::Parse(format!("bad rx bytes for {}", name)))?;
        let tx: u64 = fields[8]
            .parse()
            .map_err(|_| MonitorError::Parse(format!("bad tx bytes for {}", name)))?;
        totals.rx_bytes = totals.rx_bytes.saturating_add(rx);
        totals.tx_bytes = totals.tx_bytes.saturating_add(tx);
        matched = true;
    }

    if !matched {
        return Err(MonitorError::CounterUnavailable(match interface {
            Some(name) => format!("interface {} not found", name),
            None => "no non-loopback interface".to_string(),
        }));
    }
    Ok(totals)
}

/// Turns successive counter totals into per-interval KB/s samples.
pub struct TrafficMeter<C: TrafficCounter> {
    counter: C,
    last: Option<(TrafficTotals, Instant)>,
}

impl<C: TrafficCounter> TrafficMeter<C> {
    pub fn new(counter: C) -> Self {
        Self {
            counter,
            last: None,
        }
    }

    /// Forget the previous reading; the next sample starts a fresh interval
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Read the counter; `None` on the first read (nothing to diff against yet)
    pub fn sample_at(&mut self, now: Instant) -> MonitorResult<Option<(TrafficSample, f64)>> {
        let totals = self.counter.read_totals()?;
        let previous = self.last.replace((totals, now));
        let (prev_totals, prev_time) = match previous {
            Some(p) => p,
            None => return Ok(None),
        };

        let elapsed = now.saturating_duration_since(prev_time).as_secs_f64();
        if elapsed <= 0.0 {
            return Ok(None);
        }
        // A counter going backwards means an interface reset; count it as silence
        let rx = totals.rx_bytes.checked_sub(prev_totals.rx_bytes).unwrap_or(0);
        let tx = totals.tx_bytes.checked_sub(prev_totals.tx_bytes).unwrap_or(0);

        let sample = TrafficSample::new(
            rx as f64 / 1024.0 / elapsed,
            tx as f64 / 1024.0 / elapsed,
        );
        Ok(Some((sample, elapsed)))
    }
}
