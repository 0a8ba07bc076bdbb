//! Server-side request parsing, used on the reverse event channel (the
//! device sends us RTSP-shaped requests there) and by the mock speaker.

use super::codec::RtspCodecError;
use super::{Headers, StatusCode};

/// A parsed incoming request
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Verb as received ("POST", "SETUP", ...)
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Incremental parser for RTSP requests
pub struct RequestCodec {
    buffer: Vec<u8>,
    max_size: usize,
}

impl RequestCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_size: 16 * 1024 * 1024,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), RtspCodecError> {
        if self.buffer.len() + bytes.len() > self.max_size {
            return Err(RtspCodecError::ResponseTooLarge {
                size: self.buffer.len() + bytes.len(),
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Try to extract one complete request
    pub fn decode(&mut self) -> Result<Option<ParsedRequest>, RtspCodecError> {
        let Some(header_end) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };

        let head = String::from_utf8_lossy(&self.buffer[..header_end]).to_string();
        let mut lines = head.split("\r\n");

        let request_line = lines
            .next()
            .ok_or_else(|| RtspCodecError::InvalidStatusLine(String::new()))?;
        let mut parts = request_line.split(' ');
        let method = parts
            .next()
            .ok_or_else(|| RtspCodecError::InvalidStatusLine(request_line.to_string()))?
            .to_string();
        let uri = parts
            .next()
            .ok_or_else(|| RtspCodecError::InvalidStatusLine(request_line.to_string()))?
            .to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| RtspCodecError::InvalidHeader(line.to_string()))?;
            headers.insert(line[..colon].trim().to_string(), line[colon + 1..].trim().to_string());
        }

        let content_length = headers.content_length().unwrap_or(0);
        let total = header_end + 4 + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let body = self.buffer[header_end + 4..total].to_vec();
        self.buffer.drain(..total);

        Ok(Some(ParsedRequest {
            method,
            uri,
            headers,
            body,
        }))
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialise a response, mirroring `RtspRequest::encode`
#[must_use]
pub fn encode_response(
    status: StatusCode,
    reason: &str,
    headers: &Headers,
    body: &[u8],
) -> Vec<u8> {
    let mut output = Vec::with_capacity(128 + body.len());
    output.extend_from_slice(format!("RTSP/1.0 {} {}\r\n", status.as_u16(), reason).as_bytes());

    for (name, value) in headers.iter() {
        output.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        output.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    output.extend_from_slice(b"\r\n");
    output.extend_from_slice(body);
    output
}
