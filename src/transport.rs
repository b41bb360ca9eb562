//! Framed register transport over a raw byte link.
//!
//! A background reader task demultiplexes the byte stream into register
//! responses and telemetry stream frames. Register reads and writes send a
//! command, then correlate against the response queue with bounded retries;
//! a command that exhausts its retries yields `RegisterValue::invalid()`
//! and triggers a resync write, never an error. Only losing the link itself
//! is fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{
    FRAME_COLLECT_TIMEOUT, READ_RETRY_CEILING, RESPONSE_POLLS, RESPONSE_POLL_INTERVAL,
    RESPONSE_START, RESPONSE_TRAILING, RESYNC_PAD, STREAM_START, STREAM_TRAILING,
    WRITE_RETRY_CEILING,
};
use crate::error::{CyclerError, CyclerResult};
use crate::frame::{
    self, encode_read, encode_write, Namespace, RegisterValue, ResponseFrame, StreamFrame,
};

/// Any byte link the transport can run over: a serial port in production,
/// a `tokio::io::duplex` pair in tests.
pub trait CyclerLink: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> CyclerLink for T {}

/// Register transport handle. One per connected device.
pub struct Transport {
    label: String,
    sink: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    responses: Mutex<mpsc::UnboundedReceiver<ResponseFrame>>,
    streams: Mutex<mpsc::UnboundedReceiver<StreamFrame>>,
    /// Serializes whole read transactions (send + correlate).
    read_lock: Mutex<()>,
    /// Serializes whole write transactions, independent of reads.
    write_lock: Mutex<()>,
    kill: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Take ownership of the link and spawn the reader task.
    pub fn open(link: impl CyclerLink, label: impl Into<String>) -> Arc<Self> {
        let label = label.into();
        let (read_half, write_half) = tokio::io::split(link);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(reader_task(
            read_half,
            resp_tx,
            stream_tx,
            kill.clone(),
            Arc::clone(&closed),
            label.clone(),
        ));
        Arc::new(Transport {
            label,
            sink: Mutex::new(Box::new(write_half)),
            responses: Mutex::new(resp_rx),
            streams: Mutex::new(stream_rx),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            kill,
            closed,
        })
    }

    /// Port label this transport was opened with.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the reader task has seen EOF or an I/O error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the reader task. Idempotent.
    pub fn close(&self) {
        self.kill.cancel();
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Read one register.
    pub async fn read(&self, namespace: Namespace, addr: u8) -> CyclerResult<RegisterValue> {
        let _guard = self.read_lock.lock().await;
        let cmd = encode_read(namespace, addr);
        for _ in 0..READ_RETRY_CEILING {
            self.send(&cmd).await?;
            if let Some(resp) = self.await_response(namespace, addr).await {
                return Ok(RegisterValue::new(namespace, addr, resp.value, resp.write_echo));
            }
        }
        warn!(
            port = %self.label, %namespace, addr,
            "register read exhausted retries, resyncing"
        );
        self.resync().await?;
        Ok(RegisterValue::invalid(namespace, addr))
    }

    /// Write one register. `value` may carry either sign convention for the
    /// 0x8000 bit; anything outside ±65535 is rejected without wire I/O.
    pub async fn write(
        &self,
        namespace: Namespace,
        addr: u8,
        value: i32,
    ) -> CyclerResult<RegisterValue> {
        let folded = frame::fold_write_value(value)?;
        let _guard = self.write_lock.lock().await;
        let cmd = encode_write(namespace, addr, folded);
        for _ in 0..WRITE_RETRY_CEILING {
            self.send(&cmd).await?;
            if let Some(resp) = self.await_response(namespace, addr).await {
                return Ok(RegisterValue::new(namespace, addr, resp.value, resp.write_echo));
            }
        }
        warn!(
            port = %self.label, %namespace, addr, value,
            "register write exhausted retries, resyncing"
        );
        self.resync().await?;
        Ok(RegisterValue::invalid(namespace, addr))
    }

    /// Drain the telemetry queue, returning the newest frame if any arrived.
    pub async fn latest_stream(&self) -> Option<StreamFrame> {
        let mut rx = self.streams.lock().await;
        let mut newest = None;
        while let Ok(frame) = rx.try_recv() {
            newest = Some(frame);
        }
        newest
    }

    async fn send(&self, bytes: &[u8]) -> CyclerResult<()> {
        if self.is_closed() {
            return Err(CyclerError::LinkClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.write_all(bytes).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Poll the response queue for a frame answering (namespace, addr).
    /// Each poll drains the queue keeping only the newest frame; a frame
    /// for a different register abandons this attempt so the caller
    /// resends.
    async fn await_response(&self, namespace: Namespace, addr: u8) -> Option<ResponseFrame> {
        let mut rx = self.responses.lock().await;
        for _ in 0..RESPONSE_POLLS {
            let mut newest = None;
            while let Ok(frame) = rx.try_recv() {
                newest = Some(frame);
            }
            if let Some(frame) = newest {
                if frame.matches(namespace, addr) {
                    return Some(frame);
                }
                debug!(
                    port = %self.label,
                    got_ns = frame.namespace_code,
                    got_addr = frame.addr,
                    want_ns = namespace.code(),
                    want_addr = addr,
                    "stale response echo discarded"
                );
                return None;
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
        None
    }

    /// Push the device-side command parser past any partially transmitted
    /// command by padding with zero bytes.
    async fn resync(&self) -> CyclerResult<()> {
        self.send(&RESYNC_PAD).await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn reader_task(
    mut link: impl AsyncRead + Send + Unpin,
    responses: mpsc::UnboundedSender<ResponseFrame>,
    streams: mpsc::UnboundedSender<StreamFrame>,
    kill: CancellationToken,
    closed: Arc<AtomicBool>,
    label: String,
) {
    loop {
        let mut start = [0u8; 1];
        let read = tokio::select! {
            _ = kill.cancelled() => break,
            r = link.read_exact(&mut start) => r,
        };
        if read.is_err() {
            warn!(port = %label, "serial link closed");
            break;
        }
        match start[0] {
            RESPONSE_START => {
                let mut trailing = [0u8; RESPONSE_TRAILING];
                match timeout(FRAME_COLLECT_TIMEOUT, link.read_exact(&mut trailing)).await {
                    Ok(Ok(_)) => {
                        let _ = responses.send(ResponseFrame::from_trailing(trailing));
                    }
                    Ok(Err(_)) => {
                        warn!(port = %label, "serial link closed mid-frame");
                        break;
                    }
                    Err(_) => {
                        // Partial frame: drop it and rescan for a start byte.
                        warn!(port = %label, "response frame timed out, discarding partial");
                    }
                }
            }
            STREAM_START => {
                let mut trailing = [0u8; STREAM_TRAILING];
                match timeout(FRAME_COLLECT_TIMEOUT, link.read_exact(&mut trailing)).await {
                    Ok(Ok(_)) => {
                        let _ = streams.send(StreamFrame::from_trailing(trailing));
                    }
                    Ok(Err(_)) => {
                        warn!(port = %label, "serial link closed mid-frame");
                        break;
                    }
                    Err(_) => {
                        warn!(port = %label, "stream frame timed out, discarding partial");
                    }
                }
            }
            other => {
                // Desync: skip bytes until the next start marker.
                debug!(port = %label, byte = other, "packet loss, skipping byte");
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{cell, unit};
    use tokio::io::DuplexStream;

    /// Spawn a peer that answers every command with a correct echo frame,
    /// reading back everything written to it.
    fn echoing_peer(mut peer: DuplexStream, value: u16) {
        tokio::spawn(async move {
            let mut cmd = [0u8; 5];
            while peer.read_exact(&mut cmd).await.is_ok() {
                let [lo, hi] = value.to_le_bytes();
                let reply = [RESPONSE_START, cmd[1], cmd[2], lo, hi];
                if peer.write_all(&reply).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn read_returns_correlated_value() {
        let (ours, theirs) = tokio::io::duplex(256);
        echoing_peer(theirs, 0x1234);
        let transport = Transport::open(ours, "test");
        let v = transport.read(Namespace::Unit, unit::FIRMWARE_VER).await.unwrap();
        assert_eq!(v.value(), Some(0x1234));
        assert!(!v.write_echo);
    }

    #[tokio::test]
    async fn write_echo_carries_write_bit() {
        let (ours, theirs) = tokio::io::duplex(256);
        echoing_peer(theirs, 256);
        let transport = Transport::open(ours, "test");
        let v = transport
            .write(Namespace::Cell0, cell::CURRENT_SETPOINT, 256)
            .await
            .unwrap();
        assert!(v.write_echo);
        assert_eq!(v.value(), Some(256));
    }

    #[tokio::test]
    async fn out_of_range_write_rejected_without_io() {
        let (ours, _theirs) = tokio::io::duplex(256);
        let transport = Transport::open(ours, "test");
        let err = transport
            .write(Namespace::Cell0, cell::MODE, 70000)
            .await
            .unwrap_err();
        assert!(matches!(err, CyclerError::ValueOutOfRange(70000)));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_echo_is_discarded_and_retried() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        // First command gets a stale echo for a different register, the
        // retry gets the right one.
        tokio::spawn(async move {
            let mut cmd = [0u8; 5];
            theirs.read_exact(&mut cmd).await.unwrap();
            let stale = [RESPONSE_START, 0x04, 0x09, 0x00, 0x00];
            theirs.write_all(&stale).await.unwrap();
            theirs.read_exact(&mut cmd).await.unwrap();
            let good = [RESPONSE_START, cmd[1], cmd[2], 0x42, 0x00];
            theirs.write_all(&good).await.unwrap();
            // keep the link open
            let _ = theirs.read_exact(&mut cmd).await;
        });
        let transport = Transport::open(ours, "test");
        let v = transport.read(Namespace::Unit, unit::VCC).await.unwrap();
        assert_eq!(v.value(), Some(0x42));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_yields_invalid_and_resync_bytes() {
        let (ours, mut theirs) = tokio::io::duplex(65536);
        let transport = Transport::open(ours, "test");
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            while let Ok(n) = theirs.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
                // 50 commands of 5 bytes plus the 5 resync pad bytes
                if seen.len() >= 50 * 5 + 5 {
                    break;
                }
            }
            seen
        });
        let v = transport.read(Namespace::Cell0, cell::VOLTAGE).await.unwrap();
        assert!(!v.valid);
        assert!(v.as_voltage().is_nan());
        let seen = collector.await.unwrap();
        assert_eq!(seen.len(), 50 * 5 + 5);
        assert_eq!(&seen[seen.len() - 5..], &RESYNC_PAD);
    }

    #[tokio::test]
    async fn stream_frames_demuxed_from_responses() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let transport = Transport::open(ours, "test");
        let stream = [
            STREAM_START,
            0x01,
            0x00, // reserved
            0x03,
            0x00, // mode
            0x00,
            0x00, // status
            0x00,
            0x40, // temp
            0x00,
            0x20, // current
            0x00,
            0x60, // voltage
        ];
        theirs.write_all(&stream).await.unwrap();
        // give the reader a chance to demux
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let frame = transport.latest_stream().await.unwrap();
        assert_eq!(frame.namespace_code, 0x01);
        assert_eq!(frame.mode, 0x0003);
        assert_eq!(frame.voltage_raw, 0x6000);
    }

    #[tokio::test]
    async fn closed_link_is_fatal() {
        let (ours, theirs) = tokio::io::duplex(64);
        let transport = Transport::open(ours, "test");
        drop(theirs);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(transport.is_closed());
        let err = transport.read(Namespace::Unit, unit::VCC).await.unwrap_err();
        assert!(matches!(err, CyclerError::LinkClosed));
    }
}
