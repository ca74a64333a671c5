use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::message::JsonRpcMessage;

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("line framing error: {0}")]
    Lines(#[from] LinesCodecError),
    #[error("malformed JSON message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Frames one `JsonRpcMessage` per newline-terminated line. Grounded on the
/// line-at-a-time approach the teacher already pulls in via `tokio-util`'s
/// `codec` feature; JSON (de)serialization is layered on top of the inner
/// `LinesCodec`.
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    inner: LinesCodec,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self { inner: LinesCodec::new() }
    }
}

impl Decoder for JsonLineCodec {
    type Item = JsonRpcMessage;
    type Error = FramerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(line) if line.trim().is_empty() => self.decode(src),
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<JsonRpcMessage> for JsonLineCodec {
    type Error = FramerError;

    fn encode(&mut self, item: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        self.inner.encode(line, dst)?;
        Ok(())
    }
}
