//! # Autodetect Communication Library
//!
//! This crate supervises an external autodetect analysis process on behalf of
//! one job. It writes length-encoded records and control messages to the
//! process input, reads the stream of JSON results the process emits, and
//! turns a flush into a blocking request/response over that pair of streams.
//!
//! ## Crate Structure
//!
//! - **`communicator`**: The `AutodetectCommunicator` state machine, the single
//!   entry point callers use for one job (`write_data`, `flush_job`, `close`).
//! - **`protocol`**: The input-side wire format. Record codec, control
//!   messages, flush id generation and the `WireWriter`.
//! - **`results`**: The output-side pipeline. Frame decoder, result model,
//!   object classification, persister interface, alert observers and the
//!   background `ResultsReader` task.
//! - **`process`**: The `AutodetectProcess` trait with a native implementation
//!   that spawns the binary and an in-process `BlackHoleProcess` for tests.
//! - **`job`**: Per-job settings (`JobContext`) that shape records and the
//!   command line.
//! - **`config`**: Figment-based configuration loaded from TOML and
//!   `AUTODETECT_` environment variables.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: `AutodetectError` and the reader-side parse errors.

pub mod communicator;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod results;

pub use communicator::{AutodetectCommunicator, CommunicatorState};
pub use config::{AutodetectConfig, FlushOptions};
pub use error::{AppResult, AutodetectError};
pub use job::JobContext;
