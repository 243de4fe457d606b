//! Zstd stream compression transform.

use super::{Direction, StreamCodec, Transform};
use crate::definition::Options;
use crate::error::{EngineError, Result};
use std::io::{self, Write};
use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Registered name of the compression transform.
pub const NAME: &str = "compress";

/// Lowest accepted compression level.
pub const MIN_LEVEL: i32 = 1;
/// Highest accepted compression level.
pub const MAX_LEVEL: i32 = 9;
/// Level used when none is configured.
pub const DEFAULT_LEVEL: i32 = 3;

const DECODE_BUFFER: usize = 128 * 1024;

/// Compression method selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Zstandard frame format.
    Zstd,
}

impl Method {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "zstd" | "zstandard" => Some(Method::Zstd),
            _ => None,
        }
    }
}

/// Compresses on the way to storage and decompresses on the way back.
#[derive(Debug, Clone)]
pub struct Compress {
    method: Method,
    level: i32,
    direction: Direction,
}

impl Default for Compress {
    fn default() -> Self {
        Self {
            method: Method::Zstd,
            level: DEFAULT_LEVEL,
            direction: Direction::Forward,
        }
    }
}

impl Compress {
    /// Configured compression level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Configured method.
    pub fn method(&self) -> Method {
        self.method
    }
}

impl Transform for Compress {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, options: &Options, direction: Direction) -> Result<()> {
        let raw_method = options.get("method").unwrap_or("zstd");
        let method = Method::parse(raw_method).ok_or_else(|| EngineError::InvalidOption {
            component: NAME.to_string(),
            key: "method".to_string(),
            reason: format!("unknown method {raw_method:?}"),
        })?;
        let level = options.parse_i32(NAME, "level", DEFAULT_LEVEL)?;
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
            return Err(EngineError::InvalidOption {
                component: NAME.to_string(),
                key: "level".to_string(),
                reason: format!("{level} outside {MIN_LEVEL}..={MAX_LEVEL}"),
            });
        }
        self.method = method;
        self.level = level;
        self.direction = direction;
        Ok(())
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn codec(&self) -> io::Result<Box<dyn StreamCodec>> {
        match (self.method, self.direction) {
            (Method::Zstd, Direction::Forward) => Ok(Box::new(ZstdEncode {
                enc: Some(zstd::stream::write::Encoder::new(Vec::new(), self.level)?),
            })),
            (Method::Zstd, Direction::Backward) => Ok(Box::new(ZstdDecode::new()?)),
        }
    }
}

struct ZstdEncode {
    enc: Option<zstd::stream::write::Encoder<'static, Vec<u8>>>,
}

impl StreamCodec for ZstdEncode {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let enc = self
            .enc
            .as_mut()
            .ok_or_else(|| io::Error::other("encoder already finished"))?;
        enc.write_all(input)?;
        out.append(enc.get_mut());
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        if let Some(enc) = self.enc.take() {
            let mut rest = enc.finish()?;
            out.append(&mut rest);
        }
        Ok(())
    }
}

/// Decoder driven step by step so an unfinished frame surfaces as an error.
struct ZstdDecode {
    dec: Decoder<'static>,
    buf: Vec<u8>,
    frame_done: bool,
}

impl ZstdDecode {
    fn new() -> io::Result<Self> {
        Ok(Self {
            dec: Decoder::new()?,
            buf: vec![0u8; DECODE_BUFFER],
            frame_done: false,
        })
    }

    /// Run the decoder over `input` until it is consumed and the output is drained.
    fn pump(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut src = InBuffer::around(input);
        loop {
            let consumed = src.pos();
            let (hint, produced) = {
                let mut dst = OutBuffer::around(self.buf.as_mut_slice());
                let hint = self.dec.run(&mut src, &mut dst)?;
                (hint, dst.pos())
            };
            out.extend_from_slice(&self.buf[..produced]);
            // A run that moved nothing says nothing about the frame.
            if produced > 0 || src.pos() > consumed {
                self.frame_done = hint == 0;
            }
            if src.pos() == input.len() && produced < self.buf.len() {
                return Ok(());
            }
        }
    }
}

impl StreamCodec for ZstdDecode {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        self.pump(input, out)
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        self.pump(&[], out)?;
        if !self.frame_done {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete zstd frame",
            ));
        }
        Ok(())
    }
}
