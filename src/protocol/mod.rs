//! Input-side wire protocol
//!
//! Everything the communicator sends to the native process goes through this
//! module:
//! - [`codec::LengthEncodedCodec`] frames records as length-prefixed fields
//! - [`control::ControlMessage`] models the one-field control records
//! - [`writer::WireWriter`] drives a [`tokio_util::codec::FramedWrite`] over
//!   the process stdin
//!
//! Control message codes are single characters: `f` flush, `i` calculate
//! interim results, `r` reset buckets, `u` update configuration. A field made
//! only of spaces is padding and is ignored by the process.

pub mod codec;
pub mod control;
pub mod writer;

pub use codec::{LengthEncodedCodec, WireMessage};
pub use control::{
    ControlMessage, DataLoadParams, FlushIdGenerator, InterimResultsParams, TimeRange,
};
pub use writer::WireWriter;
