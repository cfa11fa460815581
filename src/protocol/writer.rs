//! Record writer over the process input stream.

use super::codec::{LengthEncodedCodec, WireMessage};
use super::control::ControlMessage;
use futures::SinkExt;
use std::io;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

/// Writes length-encoded records and control messages to the process.
///
/// Every public call ends with a flush of the underlying stream, so nothing
/// stays buffered in the writer between calls. Writers are not shared: the
/// communicator serializes access with its own lock.
pub struct WireWriter<W> {
    framed: FramedWrite<W, LengthEncodedCodec>,
    padding_bytes: usize,
    records_written: u64,
}

impl<W> WireWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Writer with no padding after flush messages.
    pub fn new(inner: W) -> Self {
        Self {
            framed: FramedWrite::new(inner, LengthEncodedCodec::new()),
            padding_bytes: 0,
            records_written: 0,
        }
    }

    /// Write a blank message of `bytes` after every flush message.
    pub fn with_padding(mut self, bytes: usize) -> Self {
        self.padding_bytes = bytes;
        self
    }

    /// Number of data records written so far.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Write one data record. The trailing control field is added here.
    pub async fn write_record(&mut self, fields: Vec<String>) -> io::Result<()> {
        self.framed.send(WireMessage::Record(fields)).await?;
        self.records_written += 1;
        Ok(())
    }

    /// Write a batch of records with a single flush at the end.
    pub async fn write_records<I>(&mut self, records: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut count = 0;
        for record in records {
            self.framed.feed(WireMessage::Record(record)).await?;
            count += 1;
        }
        self.framed.flush().await?;
        self.records_written += count as u64;
        trace!(count, "wrote data records");
        Ok(count)
    }

    /// Write one control message and flush.
    pub async fn write_control_message(&mut self, message: ControlMessage) -> io::Result<()> {
        debug!(kind = message.kind(), "writing control message");
        self.framed.send(WireMessage::Control(message)).await
    }

    /// Write a flush request followed by the configured padding.
    pub async fn write_flush_message(&mut self, flush_id: &str) -> io::Result<()> {
        debug!(kind = "flush", flush_id, "writing control message");
        self.framed
            .feed(WireMessage::Control(ControlMessage::Flush {
                flush_id: flush_id.to_string(),
            }))
            .await?;
        if self.padding_bytes > 0 {
            debug!(kind = "padding", bytes = self.padding_bytes, "writing control message");
            self.framed
                .feed(WireMessage::Control(ControlMessage::Padding(
                    self.padding_bytes,
                )))
                .await?;
        }
        self.framed.flush().await
    }

    /// Flush and shut down the stream, signalling end of input to the process.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        SinkExt::close(&mut self.framed).await
    }
}
