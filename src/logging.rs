//! Async append-only telemetry log sink.
//!
//! `log` enqueues a pre-formatted line and returns immediately; a writer
//! task owns all file I/O so channel control loops never block on disk.
//! Row layout is a fixed 19-column CSV: per-tick telemetry rows fill the
//! first eleven columns, per-transition summary rows fill the last eight.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

/// Header row written at the top of each playlist log file.
pub const CSV_HEADER: &str = "Cell Name,Device SN,Channel,Timestamp (s),Voltage (V),\
Current (A),Temperature (C),Impedance (Ohm),Energy (J),Charge (Coulombs),Test State,\
Test Type,Charge Capacity (Coulombs),Energy Capacity (J),Avg Impedance (Ohm),\
delta Temperature (C),Avg Current (A),Avg Voltage,Runtime (s)";

enum SinkMessage {
    Line { text: String, path: PathBuf },
    Flush(oneshot::Sender<()>),
}

/// Handle to the shared log writer. Cheap to clone; the writer task exits
/// when every handle is dropped.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl LogSink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(rx));
        LogSink { tx }
    }

    /// Enqueue one line for append to `path`. Never blocks.
    pub fn log(&self, line: impl Into<String>, path: impl Into<PathBuf>) {
        let _ = self.tx.send(SinkMessage::Line {
            text: line.into(),
            path: path.into(),
        });
    }

    /// Write the CSV header row to a fresh log file.
    pub fn log_header(&self, path: impl Into<PathBuf>) {
        self.log(CSV_HEADER, path);
    }

    /// Wait for every line enqueued so far to reach disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

async fn writer_task(mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMessage::Line { text, path } => {
                if let Err(err) = append_line(&path, &text).await {
                    error!(path = %path.display(), %err, "log append failed");
                }
            }
            SinkMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

fn fmt_ts(ts: DateTime<Local>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Per-tick telemetry row (columns 1-11; the summary columns stay empty).
#[derive(Debug, Clone)]
pub struct TelemetryRow {
    pub cell_name: String,
    pub device_sn: u32,
    pub channel: usize,
    pub timestamp: DateTime<Local>,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    /// Filled only on ticks that ran an impedance measurement.
    pub impedance: Option<f64>,
    pub energy: f64,
    pub charge: f64,
    pub state: &'static str,
}

impl TelemetryRow {
    pub fn to_csv(&self) -> String {
        let z = self
            .impedance
            .map(|z| format!("{z:.4}"))
            .unwrap_or_default();
        format!(
            "{},{},{},{},{:.4},{:.4},{:.4},{},{:.4},{:.4},{},,,,,,,,",
            self.cell_name,
            self.device_sn,
            self.channel,
            fmt_ts(self.timestamp),
            self.voltage,
            self.current,
            self.temperature,
            z,
            self.energy,
            self.charge,
            self.state,
        )
    }
}

/// Per-transition summary row (columns 12-19; the telemetry columns stay
/// empty).
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub cell_name: String,
    pub device_sn: u32,
    pub channel: usize,
    pub timestamp: DateTime<Local>,
    pub test_type: String,
    pub charge_capacity: f64,
    pub energy_capacity: f64,
    pub avg_impedance: f64,
    pub delta_temperature: f64,
    pub avg_current: f64,
    pub avg_voltage: f64,
    pub runtime_seconds: f64,
}

impl SummaryRow {
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},,,,,,,,{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{}",
            self.cell_name,
            self.device_sn,
            self.channel,
            fmt_ts(self.timestamp),
            self.test_type,
            self.charge_capacity,
            self.energy_capacity,
            self.avg_impedance,
            self.delta_temperature,
            self.avg_current,
            self.avg_voltage,
            self.runtime_seconds,
        )
    }
}
