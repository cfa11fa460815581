//! Length-encoded record codec.

use super::control::ControlMessage;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Largest single field the decoder accepts.
pub const MAX_FIELD_SIZE: usize = 64 * 1024 * 1024;

/// Largest field count the decoder accepts in one record.
pub const MAX_FIELD_COUNT: usize = 65_536;

/// One frame on the process input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Analysis values in job field order. The trailing empty control field is
    /// added by the encoder and stripped by the decoder.
    Record(Vec<String>),
    /// A one-field control record
    Control(ControlMessage),
}

impl WireMessage {
    fn from_fields(mut fields: Vec<String>) -> io::Result<Self> {
        if fields.len() == 1 {
            let field = fields.pop().unwrap_or_default();
            return ControlMessage::parse(&field).map(WireMessage::Control);
        }
        match fields.pop() {
            Some(control) if control.is_empty() => Ok(WireMessage::Record(fields)),
            Some(control) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("data record carries a non-empty control field '{control}'"),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record with no fields",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    FieldLen { remaining: usize },
    FieldData { remaining: usize, len: usize },
}

/// Codec for the process input format.
///
/// A record is a big-endian `u32` field count followed by that many fields,
/// each a big-endian `u32` byte length and then the UTF-8 bytes. Data records
/// carry one more field than the job has analysis fields: the last one is the
/// control field and is always empty. A record with exactly one field is a
/// control message.
#[derive(Debug)]
pub struct LengthEncodedCodec {
    decode_state: DecodeState,
    fields: Vec<String>,
}

impl LengthEncodedCodec {
    /// Codec waiting for the start of a frame.
    pub fn new() -> Self {
        Self {
            decode_state: DecodeState::Head,
            fields: Vec::new(),
        }
    }
}

impl Default for LengthEncodedCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn put_count(dst: &mut BytesMut, count: usize) -> io::Result<()> {
    let count = u32::try_from(count).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "too many fields in one record")
    })?;
    dst.put_u32(count);
    Ok(())
}

fn put_field(dst: &mut BytesMut, field: &str) -> io::Result<()> {
    let len = u32::try_from(field.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("field of {} bytes cannot be length encoded", field.len()),
        )
    })?;
    dst.reserve(4 + field.len());
    dst.put_u32(len);
    dst.put_slice(field.as_bytes());
    Ok(())
}

impl Encoder<WireMessage> for LengthEncodedCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: WireMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        match msg {
            WireMessage::Record(fields) => {
                put_count(dst, fields.len() + 1)?;
                for field in &fields {
                    put_field(dst, field)?;
                }
                put_field(dst, "")
            }
            WireMessage::Control(control) => {
                put_count(dst, 1)?;
                put_field(dst, &control.to_field())
            }
        }
    }
}

impl Decoder for LengthEncodedCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>, io::Error> {
        loop {
            match self.decode_state {
                DecodeState::Head => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let count = src.get_u32() as usize;
                    if count == 0 || count > MAX_FIELD_COUNT {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid field count {count}"),
                        ));
                    }
                    self.fields = Vec::with_capacity(count);
                    self.decode_state = DecodeState::FieldLen { remaining: count };
                }

                DecodeState::FieldLen { remaining: 0 } => {
                    self.decode_state = DecodeState::Head;
                    let fields = std::mem::take(&mut self.fields);
                    return WireMessage::from_fields(fields).map(Some);
                }

                DecodeState::FieldLen { remaining } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len > MAX_FIELD_SIZE {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("field of {len} bytes exceeds {MAX_FIELD_SIZE}"),
                        ));
                    }
                    src.reserve(len);
                    self.decode_state = DecodeState::FieldData { remaining, len };
                }

                DecodeState::FieldData { remaining, len } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let bytes = src.split_to(len);
                    let field = String::from_utf8(bytes.to_vec())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    self.fields.push(field);
                    self.decode_state = DecodeState::FieldLen {
                        remaining: remaining - 1,
                    };
                }
            }
        }
    }
}
