//! In-process stand-in for the native binary.
//!
//! Decodes everything written to it, keeps a log of the decoded messages and
//! answers each flush with `{"flush":"<id>"}` inside one output array. Used to
//! exercise the communicator and the reader without any native code.

use super::{AutodetectProcess, ErrorBuffer, ProcessInput, ProcessOutput};
use crate::error::AppResult;
use crate::protocol::{ControlMessage, LengthEncodedCodec, WireMessage};
use crate::results::FlushAcknowledgement;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
struct Shared {
    received: Mutex<Vec<WireMessage>>,
    acknowledge: bool,
    alive: AtomicBool,
    errors: ErrorBuffer,
    close_count: AtomicUsize,
}

/// Test double that acknowledges flushes without running any analysis.
///
/// # Example
///
/// ```
/// use autodetect_comm::process::{AutodetectProcess, BlackHoleProcess};
///
/// # tokio_test::block_on(async {
/// let process = BlackHoleProcess::stalled().with_error_output("Mock process has stalled");
/// assert!(process.is_alive());
/// assert_eq!(process.read_error(), "Mock process has stalled");
/// # })
/// ```
pub struct BlackHoleProcess {
    shared: Arc<Shared>,
    input: Mutex<Option<ProcessInput>>,
    output: Mutex<Option<ProcessOutput>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BlackHoleProcess {
    /// A process that acknowledges every flush immediately.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::start(true)
    }

    /// A process that reads everything and never acknowledges.
    pub fn stalled() -> Self {
        Self::start(false)
    }

    fn start(acknowledge: bool) -> Self {
        let (input, process_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (process_stdout, output) = tokio::io::duplex(PIPE_CAPACITY);

        let shared = Arc::new(Shared {
            received: Mutex::new(Vec::new()),
            acknowledge,
            alive: AtomicBool::new(true),
            errors: ErrorBuffer::new(1),
            close_count: AtomicUsize::new(0),
        });
        let task = tokio::spawn(run(process_stdin, process_stdout, Arc::clone(&shared)));

        Self {
            shared,
            input: Mutex::new(Some(Box::new(input))),
            output: Mutex::new(Some(Box::new(output))),
            task: Mutex::new(Some(task)),
        }
    }

    /// Text returned by `read_error`.
    pub fn with_error_output(self, text: impl Into<String>) -> Self {
        self.shared.errors.push(text);
        self
    }

    /// Make the liveness check report the process as gone.
    pub fn mark_dead(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }

    /// Every message decoded so far, in arrival order.
    pub fn received(&self) -> Vec<WireMessage> {
        self.shared.received.lock().clone()
    }

    /// Data records decoded so far.
    pub fn records(&self) -> Vec<Vec<String>> {
        self.shared
            .received
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                WireMessage::Record(fields) => Some(fields.clone()),
                WireMessage::Control(_) => None,
            })
            .collect()
    }

    /// Ids of the flush messages decoded so far.
    pub fn flush_ids(&self) -> Vec<String> {
        self.shared
            .received
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                WireMessage::Control(ControlMessage::Flush { flush_id }) => {
                    Some(flush_id.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.shared.close_count.load(Ordering::SeqCst)
    }
}

impl Default for BlackHoleProcess {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(stdin: DuplexStream, mut stdout: DuplexStream, shared: Arc<Shared>) {
    let mut frames = FramedRead::new(stdin, LengthEncodedCodec::new());
    let mut output_open = stdout.write_all(b"[").await.is_ok();
    let mut first = true;

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "black hole process could not decode its input");
                break;
            }
        };
        shared.received.lock().push(message.clone());

        let WireMessage::Control(ControlMessage::Flush { flush_id }) = message else {
            continue;
        };
        if !shared.acknowledge || !output_open {
            continue;
        }
        let ack = match serde_json::to_string(&FlushAcknowledgement { id: flush_id }) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "could not encode flush acknowledgement");
                continue;
            }
        };
        let separator = if first { "" } else { "," };
        first = false;
        output_open = stdout
            .write_all(format!("{separator}{ack}").as_bytes())
            .await
            .is_ok()
            && stdout.flush().await.is_ok();
    }

    if output_open {
        let _ = stdout.write_all(b"]").await;
        let _ = stdout.shutdown().await;
    }
    debug!("black hole process reached end of input");
}

#[async_trait]
impl AutodetectProcess for BlackHoleProcess {
    fn take_input(&self) -> Option<ProcessInput> {
        self.input.lock().take()
    }

    fn take_output(&self) -> Option<ProcessOutput> {
        self.output.lock().take()
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn read_error(&self) -> String {
        self.shared.errors.contents()
    }

    async fn close(&self, timeout: Duration) -> AppResult<()> {
        self.shared.close_count.fetch_add(1, Ordering::SeqCst);
        drop(self.input.lock().take());

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!(?timeout, "black hole process did not stop in time");
                task.abort();
            }
        }
        self.shared.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}
