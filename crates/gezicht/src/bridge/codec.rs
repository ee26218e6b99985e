//! Line-delimited JSON codec for worker stdio.
//!
//! Frames on raw `\n`-terminated chunks + serde_json for serialization, so a
//! line that is not valid UTF-8 is just another malformed frame.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Longest line accepted from a worker before it is discarded.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Newline-framed chunks of at most `max_length` bytes, content untouched.
pub fn line_framing(max_length: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length)
}

/// Codec that frames messages as newline-terminated JSON objects.
///
/// Decoding never fails on bad content: blank lines are skipped, and lines that
/// are not valid JSON for `T` (including invalid UTF-8, or longer than
/// [`MAX_LINE_LENGTH`]) are logged and dropped. Only I/O errors end the stream.
pub struct NdjsonCodec<T> {
    inner: AnyDelimiterCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for NdjsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NdjsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: line_framing(MAX_LINE_LENGTH),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> NdjsonCodec<T> {
    fn parse(frame: &[u8]) -> Option<T> {
        let frame = frame.trim_ascii();
        if frame.is_empty() {
            return None;
        }
        match serde_json::from_slice(frame) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(error = %e, line_len = frame.len(), "Dropping malformed frame");
                None
            }
        }
    }

    fn next_item(
        frame: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Option<T>>, io::Error> {
        match frame {
            Ok(Some(chunk)) => Ok(Some(Self::parse(&chunk))),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_LENGTH, "Dropping oversized frame");
                Ok(Some(None))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: DeserializeOwned> Decoder for NdjsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Self::next_item(self.inner.decode(src))? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Self::next_item(self.inner.decode_eof(src))? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for NdjsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        if json.len() > 100_000 {
            tracing::info!(
                json_size_bytes = json.len(),
                json_size_kb = json.len() / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(json, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}
