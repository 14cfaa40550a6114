//! Per-packet latency tracing
//!
//! Enabled by `write-packet-metrics <path>`: appends one CSV line per
//! decided packet with the time from kernel hand-off to verdict.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use warden_common::Timestamp;
use warden_conntrack::Fingerprint;
use warden_packet::{PacketInfo, Verdict};

pub struct PacketMetricsWriter {
    file: Mutex<File>,
}

impl PacketMetricsWriter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "timestamp_us,connection,verdict,latency_us")?;
        Ok(Self { file: Mutex::new(file) })
    }

    pub fn record(&self, fingerprint: &Fingerprint, verdict: Verdict, started: Timestamp) {
        let line = format!(
            "{},{},{},{}\n",
            Timestamp::now().as_nanos() / 1000,
            fingerprint,
            verdict,
            started.elapsed_micros()
        );
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            tracing::debug!(error = %e, "packet metrics write failed");
        }
    }

    pub fn record_fasttrack(&self, info: &PacketInfo, rule: &str, started: Timestamp) {
        let line = format!(
            "{},fasttrack:{},{},{}\n",
            Timestamp::now().as_nanos() / 1000,
            rule,
            info.remote_ip(),
            started.elapsed_micros()
        );
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            tracing::debug!(error = %e, "packet metrics write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_packet::Protocol;

    #[test]
    fn test_writes_lines() {
        let dir = std::env::temp_dir().join("warden-metrics-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("metrics-{}.csv", std::process::id()));

        let writer = PacketMetricsWriter::open(&path).unwrap();
        let fingerprint = Fingerprint {
            protocol: Protocol::Tcp,
            local_ip: "10.0.0.5".parse().unwrap(),
            local_port: 40000,
            remote_ip: "1.1.1.1".parse().unwrap(),
            remote_port: 443,
        };
        writer.record(&fingerprint, Verdict::Accept, Timestamp::now());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("timestamp_us"));
        assert!(contents.contains("accept"));
        std::fs::remove_file(&path).ok();
    }
}
