//! Terminal image handoff.
//!
//! The pipeline only decides *whether* a payload goes to an image renderer;
//! pixel work is a collaborator behind [`ImageRenderer`]. The built-in
//! renderer emits inline-image escape sequences for terminals that accept
//! the encoded file as-is (kitty wants PNG, iTerm2-compatible terminals
//! take any common container). Anything else is declined so the pipeline
//! falls through to its binary-output handling.

use crate::error::Error;
use crate::request::ImageMode;
use crate::sniff::ImageFormat;
use crate::term::{ImageProtocol, TermEnv};
use base64::Engine as _;
use std::io::Write;

/// Renders one image to the terminal. Returns `false` when the image
/// cannot be handled so the caller can fall back.
pub trait ImageRenderer {
    fn render(
        &self,
        data: &[u8],
        format: ImageFormat,
        out: &mut dyn Write,
    ) -> Result<bool, Error>;
}

/// Should this response be handed to the renderer at all?
pub fn should_render(mode: ImageMode, env: &TermEnv) -> bool {
    mode == ImageMode::Auto && env.stdout_tty && env.image_protocol.is_some()
}

/// Inline-image escape-sequence renderer.
pub struct InlineRenderer {
    protocol: ImageProtocol,
}

impl InlineRenderer {
    pub fn new(protocol: ImageProtocol) -> Self {
        Self { protocol }
    }
}

impl ImageRenderer for InlineRenderer {
    fn render(
        &self,
        data: &[u8],
        format: ImageFormat,
        out: &mut dyn Write,
    ) -> Result<bool, Error> {
        match self.protocol {
            ImageProtocol::Kitty => {
                // Kitty's graphics protocol takes PNG data directly
                // (f=100). Other containers would need decoding first.
                if format != ImageFormat::Png {
                    return Ok(false);
                }
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                let mut chunks = encoded.as_bytes().chunks(4096).peekable();
                let mut first = true;
                while let Some(chunk) = chunks.next() {
                    let more = if chunks.peek().is_some() { 1 } else { 0 };
                    if first {
                        write!(out, "\x1b_Gf=100,a=T,m={more};")?;
                        first = false;
                    } else {
                        write!(out, "\x1b_Gm={more};")?;
                    }
                    out.write_all(chunk)?;
                    write!(out, "\x1b\\")?;
                }
                writeln!(out)?;
                Ok(true)
            }
            ImageProtocol::Iterm2 => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                write!(
                    out,
                    "\x1b]1337;File=inline=1;size={}:{}\x07",
                    data.len(),
                    encoded
                )?;
                writeln!(out)?;
                Ok(true)
            }
        }
    }
}
