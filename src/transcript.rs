//! Session transcripts for offline replay
//!
//! A transcript describes the two halves of a stream conversation, one step
//! per line:
//!
//! ```text
//! # comment
//! C: a001 LOGIN user pass      client text, CRLF appended
//! S: a001 OK done              server text, CRLF appended
//! S= partial                   raw text, nothing appended
//! C% 78 9c 00                  hex bytes
//! !deflate                     later steps are DEFLATE compressed
//! ```

use std::io::Write;
use std::path::Path;

use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::core::Direction;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Client,
    Server,
}

impl Sender {
    /// Stream direction when the client side holds the forward key
    pub fn direction(self) -> Direction {
        match self {
            Sender::Client => Direction::Forward,
            Sender::Server => Direction::Reverse,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sender::Client => "C",
            Sender::Server => "S",
        }
    }
}

/// One chunk of bytes sent by either side
#[derive(Debug, Clone)]
pub struct TranscriptStep {
    pub sender: Sender,
    /// Bytes as they appear on the wire
    pub data: Vec<u8>,
    /// Bytes before compression
    pub plain_len: usize,
    pub deflated: bool,
    /// Source line, 1-based
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    steps: Vec<TranscriptStep>,
}

impl Transcript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut steps = Vec::new();
        // One compressor per side once !deflate was seen
        let mut deflate: Option<[DeflateEncoder<Vec<u8>>; 2]> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim_end_matches('\r');
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(directive) = trimmed.strip_prefix('!') {
                match directive.trim().to_ascii_lowercase().as_str() {
                    "deflate" => {
                        if deflate.is_none() {
                            deflate = Some([
                                DeflateEncoder::new(Vec::new(), Compression::default()),
                                DeflateEncoder::new(Vec::new(), Compression::default()),
                            ]);
                        }
                    }
                    other => {
                        return Err(Error::Transcript {
                            line,
                            msg: format!("unknown directive !{}", other),
                        })
                    }
                }
                continue;
            }

            let (sender, plain) = parse_step(text, line)?;
            let plain_len = plain.len();
            let (data, deflated) = match deflate.as_mut() {
                Some(encoders) => {
                    let enc = &mut encoders[sender.direction().index()];
                    enc.write_all(&plain)?;
                    enc.flush()?;
                    (std::mem::take(enc.get_mut()), true)
                }
                None => (plain, false),
            };

            steps.push(TranscriptStep {
                sender,
                data,
                plain_len,
                deflated,
                line,
            });
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[TranscriptStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Wire bytes sent by one side
    pub fn bytes_sent(&self, sender: Sender) -> usize {
        self.steps
            .iter()
            .filter(|s| s.sender == sender)
            .map(|s| s.data.len())
            .sum()
    }
}

fn parse_step(text: &str, line: usize) -> Result<(Sender, Vec<u8>)> {
    let err = |msg: &str| Error::Transcript {
        line,
        msg: msg.to_string(),
    };

    let mut chars = text.chars();
    let sender = match chars.next() {
        Some('C') | Some('c') => Sender::Client,
        Some('S') | Some('s') => Sender::Server,
        _ => return Err(err("expected C or S")),
    };
    let mode = chars.next().ok_or_else(|| err("missing mode after sender"))?;
    let rest = chars.as_str();
    let rest = rest.strip_prefix(' ').unwrap_or(rest);

    match mode {
        ':' => {
            let mut data = rest.as_bytes().to_vec();
            data.extend_from_slice(b"\r\n");
            Ok((sender, data))
        }
        '=' => Ok((sender, rest.as_bytes().to_vec())),
        '%' => parse_hex(rest).ok_or_else(|| err("invalid hex bytes")).map(|d| (sender, d)),
        _ => Err(err("mode must be one of ':', '=' or '%'")),
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
