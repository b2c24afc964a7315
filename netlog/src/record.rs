use std::{borrow::Cow, fmt, net::Ipv4Addr, time::Duration};

use chrono::{DateTime, Utc};
use netlog_common::Direction;
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Second-resolution timestamp plus milliseconds with trailing zeros trimmed,
/// so `10:00:00.250` prints as `10:00:00.25` and a whole second has no
/// fraction at all.
fn format_timestamp(at: &DateTime<Utc>) -> String {
    let mut out = at.format(TIMESTAMP_FORMAT).to_string();
    let millis = at.timestamp_subsec_millis() % 1000;
    if millis > 0 {
        let fraction = format!("{millis:03}");
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

/// Snapshot of a flow taken when it matured.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub namespace: String,
    pub name: String,
    pub direction: Direction,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: Cow<'static, str>,
    pub port: u16,
    pub total_bytes: u64,
    pub packets: u64,
}

impl FlowRecord {
    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }

    /// Only records owned by a known workload are exported.
    pub fn is_attributed(&self) -> bool {
        !self.namespace.is_empty()
    }

    pub fn structured(&self) -> StructuredRecord<'_> {
        StructuredRecord {
            timestamp: format_timestamp(&self.start),
            namespace: &self.namespace,
            name: &self.name,
            duration: format!("{:.2}s", self.duration().as_secs_f64()),
            source: self.source.to_string(),
            destination: self.destination.to_string(),
            protocol: &self.protocol,
            port: self.port.to_string(),
            total_bytes: self.total_bytes,
            packets: self.packets,
        }
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} => {} {} {} {} bytes ({} packets in {:.2}s)",
            self.start,
            self.namespace,
            self.name,
            self.source,
            self.destination,
            self.protocol,
            self.port,
            self.total_bytes,
            self.packets,
            self.duration().as_secs_f64()
        )
    }
}

/// Field layout shared by the JSON and CSV encodings.
#[derive(Debug, Serialize)]
pub struct StructuredRecord<'a> {
    pub timestamp: String,
    pub namespace: &'a str,
    pub name: &'a str,
    pub duration: String,
    pub source: String,
    pub destination: String,
    pub protocol: &'a str,
    pub port: String,
    pub total_bytes: u64,
    pub packets: u64,
}
