//! Framing for the process output stream.
//!
//! The output is a sequence of JSON objects, usually wrapped in one or more
//! top-level arrays. Objects are found by scanning bytes and tracking brace
//! depth and string state, so framing does not depend on line breaks or on
//! where the process happens to flush its output.

use crate::error::ResultStreamError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Largest single result object accepted.
pub const MAX_OBJECT_SIZE: usize = 64 * 1024 * 1024;

/// One framed output element.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFrame {
    /// A complete, syntactically valid JSON value starting with `{`
    Object(serde_json::Value),
    /// A complete object whose contents failed to parse
    Malformed(String),
}

#[derive(Debug, Default)]
struct ObjectScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
    scanned: usize,
}

/// Incremental decoder from output bytes to JSON objects.
#[derive(Debug, Default)]
pub struct ResultsDecoder {
    in_array: bool,
    object: Option<ObjectScan>,
}

impl ResultsDecoder {
    /// Decoder expecting the opening `[`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume separators until the next object starts or input runs out.
    fn skip_to_object(&mut self, src: &mut BytesMut) -> Result<bool, ResultStreamError> {
        while let Some(&byte) = src.first() {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' | b',' => src.advance(1),
                b'[' if self.in_array => {
                    return Err(ResultStreamError::Corrupt(
                        "should start with an array of objects or an object = START_ARRAY"
                            .to_string(),
                    ));
                }
                b'[' => {
                    self.in_array = true;
                    src.advance(1);
                }
                b']' if self.in_array => {
                    self.in_array = false;
                    src.advance(1);
                }
                b'{' => {
                    self.object = Some(ObjectScan::default());
                    return Ok(true);
                }
                other => {
                    return Err(ResultStreamError::Corrupt(format!(
                        "unexpected byte 0x{other:02x} between result objects"
                    )));
                }
            }
        }
        Ok(false)
    }
}

impl Decoder for ResultsDecoder {
    type Item = OutputFrame;
    type Error = ResultStreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OutputFrame>, ResultStreamError> {
        if self.object.is_none() && !self.skip_to_object(src)? {
            return Ok(None);
        }
        let Some(scan) = self.object.as_mut() else {
            return Ok(None);
        };

        let mut end = None;
        for (offset, &byte) in src[scan.scanned..].iter().enumerate() {
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        end = Some(scan.scanned + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            scan.scanned = src.len();
            if scan.scanned > MAX_OBJECT_SIZE {
                return Err(ResultStreamError::Corrupt(format!(
                    "result object exceeds {MAX_OBJECT_SIZE} bytes"
                )));
            }
            return Ok(None);
        };

        self.object = None;
        let bytes = src.split_to(end);
        let frame = match serde_json::from_slice(&bytes) {
            Ok(value) => OutputFrame::Object(value),
            Err(e) => OutputFrame::Malformed(e.to_string()),
        };
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<OutputFrame>, ResultStreamError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.object.is_some() {
            return Err(ResultStreamError::Corrupt(format!(
                "stream ended inside a result object ({} bytes buffered)",
                src.len()
            )));
        }
        Ok(None)
    }
}
