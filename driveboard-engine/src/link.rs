//! Link Manager (spec.md §4.2): owns the serial transport and the
//! double-byte transmission discipline every outbound byte requires.
//!
//! Modeled on the teacher's `device.rs` connect/read/write pattern, but
//! over `tokio-serial` instead of USB bulk/interrupt endpoints.

use crate::error::EngineError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Number of connection attempts before giving up, matching the retry
/// loop shape in the teacher's `connect()`.
const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

pub struct LinkReader {
    inner: ReadHalf<SerialStream>,
}

pub struct LinkWriter {
    inner: WriteHalf<SerialStream>,
}

impl LinkReader {
    pub async fn read_byte(&mut self) -> Result<u8, EngineError> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf[0])
    }
}

impl LinkWriter {
    /// Write `bytes`, each duplicated back-to-back, in a single
    /// `write_all` call so no other writer can interleave a byte
    /// between a byte and its duplicate (spec.md §9).
    pub async fn write_duplicated(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut out = Vec::with_capacity(bytes.len() * 2);
        for &b in bytes {
            out.push(b);
            out.push(b);
        }
        self.inner.write_all(&out).await?;
        Ok(())
    }
}

/// Open the serial port, retrying transient failures the way the
/// teacher's USB `connect()` retries claiming the interface.
pub async fn open(port: &str, baud: u32) -> Result<(LinkReader, LinkWriter), EngineError> {
    let mut last_err = None;
    for attempt in 0..CONNECT_RETRIES {
        match tokio_serial::new(port, baud).open_native_async() {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                return Ok((LinkReader { inner: read_half }, LinkWriter { inner: write_half }));
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "serial open failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
    Err(last_err.map(EngineError::from).unwrap_or(EngineError::PortNotFound(port.to_string())))
}
