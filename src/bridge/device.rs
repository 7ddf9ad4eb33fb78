//! Virtual interface abstraction
//!
//! The capture loop reads raw IP frames from a device and the forwarder
//! writes response frames back. Behind a trait so tests can drive the whole
//! bridge with an in-memory device.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::{MonitorError, Result};

/// A readable/writable virtual network interface carrying raw IP frames
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one frame into `buf`, returning its length. Returns Ok(0) when
    /// the device has been closed.
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one frame back to the device
    async fn write_frame(&self, frame: &[u8]) -> Result<()>;
}

/// In-memory device backed by channels. Frames pushed into the inbound
/// sender appear on `read_frame`; frames written by the bridge land on the
/// outbound receiver.
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl ChannelDevice {
    /// Returns the device plus the handles a test uses to feed and observe it
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }
}

#[async_trait]
impl TunDevice for ChannelDevice {
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let frame = match self.inbound.lock().await.recv().await {
            Some(frame) => frame,
            None => return Ok(0),
        };
        if frame.len() > buf.len() {
            return Err(MonitorError::Forwarding(format!(
                "frame of {} bytes exceeds read buffer",
                frame.len()
            )));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.outbound
            .send(frame.to_vec())
            .await
            .map_err(|_| MonitorError::Forwarding("device write side closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_device_roundtrip() {
        let (device, in_tx, mut out_rx) = ChannelDevice::new(4);

        in_tx.send(vec![0x45, 0, 0, 20]).await.unwrap();
        let mut buf = [0u8; 1500];
        let n = device.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);

        device.write_frame(&[1, 2, 3]).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_zero_after_close() {
        let (device, in_tx, _out_rx) = ChannelDevice::new(4);
        drop(in_tx);
        let mut buf = [0u8; 1500];
        assert_eq!(device.read_frame(&mut buf).await.unwrap(), 0);
    }
}
