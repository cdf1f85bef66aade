//! Shared protocol logic for the framed transport
//!
//! Pure functions only: framing a payload, parsing a header, and breaking a
//! payload into tokens. The async session code builds on these.

use crate::error::{FabricError, FabricResult};
use crate::protocol::{tag, DELIMITERS, HEADER_WIDTH, MAX_PAYLOAD, QUOTE};

/// Validate payload size against the 4-digit header limit
pub fn validate_payload_size(size: usize) -> FabricResult<()> {
    if size > MAX_PAYLOAD {
        return Err(FabricError::Framing(format!(
            "payload too large: {} bytes (max: {})",
            size, MAX_PAYLOAD
        )));
    }
    Ok(())
}

/// Build the fixed-width ASCII header for a payload of `len` bytes
pub fn build_header(len: usize) -> FabricResult<[u8; HEADER_WIDTH]> {
    validate_payload_size(len)?;
    let text = format!("{:0width$}", len, width = HEADER_WIDTH);
    let mut header = [0u8; HEADER_WIDTH];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Frame a payload: header followed by the payload bytes
pub fn encode(payload: &[u8]) -> FabricResult<Vec<u8>> {
    let header = build_header(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_WIDTH + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse a header into the payload length it announces
pub fn decode_header(header: &[u8; HEADER_WIDTH]) -> FabricResult<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(FabricError::Framing(format!(
            "non-numeric header {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    let len = header
        .iter()
        .fold(0usize, |acc, b| acc * 10 + usize::from(b - b'0'));
    validate_payload_size(len)?;
    Ok(len)
}

/// Convert payload bytes into the text handed to handlers
pub fn decode_payload(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split a complete frame back into its payload
pub fn decode(frame: &[u8]) -> FabricResult<Vec<u8>> {
    if frame.len() < HEADER_WIDTH {
        return Err(FabricError::Framing(format!(
            "short frame: {} bytes",
            frame.len()
        )));
    }
    let mut header = [0u8; HEADER_WIDTH];
    header.copy_from_slice(&frame[..HEADER_WIDTH]);
    let len = decode_header(&header)?;
    let body = &frame[HEADER_WIDTH..];
    if body.len() != len {
        return Err(FabricError::Framing(format!(
            "header announces {} bytes, frame carries {}",
            len,
            body.len()
        )));
    }
    Ok(body.to_vec())
}

/// Break a payload into tokens.
///
/// Runs of delimiter characters collapse, and a run bounded by `quote` is a
/// single token with the quotes removed. Empty tokens are never produced.
pub fn tokenize_with(payload: &str, delims: &str, quote: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in payload.chars() {
        if c == quote {
            quoted = !quoted;
            continue;
        }
        if !quoted && delims.contains(c) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Tokenize with the standard delimiters and quote character
pub fn tokenize(payload: &str) -> Vec<String> {
    tokenize_with(payload, DELIMITERS, QUOTE)
}

/// Closed set of tags that may lead a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Welcome,
    Received,
    Complete,
    Busy,
    Error,
    Status,
    Process,
    Exit,
    ImGone,
    Shutdown,
    GoHome,
    Confirm,
    Data,
    TipTilt,
    Focus,
    Failed,
}

impl Tag {
    pub fn parse(token: &str) -> Option<Tag> {
        let t = match token {
            tag::WELCOME => Tag::Welcome,
            tag::RECEIVED => Tag::Received,
            tag::COMPLETE => Tag::Complete,
            tag::BUSY => Tag::Busy,
            tag::ERROR => Tag::Error,
            tag::STATUS => Tag::Status,
            tag::PROCESS => Tag::Process,
            tag::EXIT => Tag::Exit,
            tag::IMGONE => Tag::ImGone,
            tag::SHUTDOWN => Tag::Shutdown,
            tag::GOHOME => Tag::GoHome,
            tag::CONFIRM => Tag::Confirm,
            tag::DATA => Tag::Data,
            tag::TIP_TILT => Tag::TipTilt,
            tag::FOCUS => Tag::Focus,
            tag::FAILED => Tag::Failed,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Welcome => tag::WELCOME,
            Tag::Received => tag::RECEIVED,
            Tag::Complete => tag::COMPLETE,
            Tag::Busy => tag::BUSY,
            Tag::Error => tag::ERROR,
            Tag::Status => tag::STATUS,
            Tag::Process => tag::PROCESS,
            Tag::Exit => tag::EXIT,
            Tag::ImGone => tag::IMGONE,
            Tag::Shutdown => tag::SHUTDOWN,
            Tag::GoHome => tag::GOHOME,
            Tag::Confirm => tag::CONFIRM,
            Tag::Data => tag::DATA,
            Tag::TipTilt => tag::TIP_TILT,
            Tag::Focus => tag::FOCUS,
            Tag::Failed => tag::FAILED,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the first token of a payload turned out to be
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lead {
    Tag(Tag),
    Code(i32),
    Unknown(String),
    Empty,
}

pub fn classify(tokens: &[String]) -> Lead {
    match tokens.first() {
        None => Lead::Empty,
        Some(first) => {
            if let Some(t) = Tag::parse(first) {
                Lead::Tag(t)
            } else if let Ok(code) = first.parse::<i32>() {
                Lead::Code(code)
            } else {
                Lead::Unknown(first.clone())
            }
        }
    }
}
