//! Decoding layers spliced into a stream
//!
//! A [`Decoder`] turns wire bytes into the bytes a protocol parser wants to
//! see. [`decode_growable`] drives a decoder into a buffer that doubles
//! whenever the decoder runs out of output space.

use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;
use tracing::trace;

/// Largest output a single segment may decode to
pub const MAX_DECODED_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{decoder}: corrupt input: {msg}")]
    Corrupt { decoder: &'static str, msg: String },

    #[error("decoded output exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// All input consumed, nothing pending
    Done,
    /// Output buffer filled up; call again with more room
    NeedMoreOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeProgress {
    pub consumed: usize,
    pub produced: usize,
    pub status: DecodeStatus,
}

pub trait Decoder: Send {
    fn name(&self) -> &'static str;

    /// Initial output size for `input_len` bytes of input
    fn estimate_output_size(&self, input_len: usize) -> usize;

    /// Decode as much of `input` as fits into `output`.
    ///
    /// Calling again with the unconsumed input and a fresh output slice
    /// continues where the previous call stopped.
    fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<DecodeProgress, DecodeError>;
}

/// Raw DEFLATE stream (no zlib header), as negotiated by IMAP COMPRESS
pub struct DeflateDecoder {
    inner: Decompress,
    finished: bool,
}

impl DeflateDecoder {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
            finished: false,
        }
    }

    pub fn total_in(&self) -> u64 {
        self.inner.total_in()
    }

    pub fn total_out(&self) -> u64 {
        self.inner.total_out()
    }
}

impl Default for DeflateDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DeflateDecoder {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn estimate_output_size(&self, input_len: usize) -> usize {
        (input_len * 2).max(64)
    }

    fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<DecodeProgress, DecodeError> {
        if self.finished {
            // Trailing bytes after the final block are ignored
            return Ok(DecodeProgress {
                consumed: input.len(),
                produced: 0,
                status: DecodeStatus::Done,
            });
        }

        let before_in = self.inner.total_in();
        let before_out = self.inner.total_out();

        let status = self
            .inner
            .decompress(input, output, FlushDecompress::Sync)
            .map_err(|e| DecodeError::Corrupt {
                decoder: "deflate",
                msg: e.to_string(),
            })?;

        let consumed = (self.inner.total_in() - before_in) as usize;
        let produced = (self.inner.total_out() - before_out) as usize;

        let status = match status {
            Status::StreamEnd => {
                self.finished = true;
                DecodeStatus::Done
            }
            _ if produced == output.len() && !output.is_empty() => DecodeStatus::NeedMoreOutput,
            _ => DecodeStatus::Done,
        };

        Ok(DecodeProgress {
            consumed,
            produced,
            status,
        })
    }
}

/// Decode `input` completely, doubling the output buffer as needed
pub fn decode_growable(decoder: &mut dyn Decoder, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = vec![0u8; decoder.estimate_output_size(input.len()).max(1)];
    let mut consumed = 0;
    let mut produced = 0;

    loop {
        let progress = decoder.decode(&input[consumed..], &mut out[produced..])?;
        consumed += progress.consumed;
        produced += progress.produced;

        match progress.status {
            DecodeStatus::Done => break,
            DecodeStatus::NeedMoreOutput => {
                let new_len = out.len() * 2;
                if new_len > MAX_DECODED_SIZE {
                    return Err(DecodeError::TooLarge(MAX_DECODED_SIZE));
                }
                trace!("Growing {} output buffer to {} bytes", decoder.name(), new_len);
                out.resize(new_len, 0);
            }
        }
    }

    out.truncate(produced);
    Ok(out)
}
