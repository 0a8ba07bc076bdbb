use thiserror::Error;

use super::{Headers, RtspResponse, StatusCode};

/// Errors during response parsing
#[derive(Debug, Error)]
pub enum RtspCodecError {
    #[error("invalid status line: {0}")]
    InvalidStatusLine(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("response too large: {size} bytes")]
    ResponseTooLarge { size: usize },
}

/// Incremental parser for RTSP responses.
///
/// Feed bytes with `feed()`, then call `decode()` until it returns `None`.
/// Ciphered connections feed decrypted plaintext here; the codec itself never
/// touches the socket.
pub struct RtspCodec {
    buffer: Vec<u8>,
    max_size: usize,
    state: ParseState,
}

enum ParseState {
    StatusLine,
    Headers {
        status: StatusCode,
        reason: String,
    },
    Body {
        status: StatusCode,
        reason: String,
        headers: Headers,
        content_length: usize,
    },
}

impl RtspCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_size: 4 * 1024 * 1024,
            state: ParseState::StatusLine,
        }
    }

    /// Append received plaintext
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), RtspCodecError> {
        if self.buffer.len() + bytes.len() > self.max_size {
            return Err(RtspCodecError::ResponseTooLarge {
                size: self.buffer.len() + bytes.len(),
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Try to extract one complete response
    pub fn decode(&mut self) -> Result<Option<RtspResponse>, RtspCodecError> {
        loop {
            match &self.state {
                ParseState::StatusLine => {
                    let Some(line_end) = find_crlf(&self.buffer) else {
                        return Ok(None);
                    };

                    let line = String::from_utf8_lossy(&self.buffer[..line_end]).to_string();
                    let (status, reason) = parse_status_line(&line)?;
                    self.buffer.drain(..line_end + 2);
                    self.state = ParseState::Headers { status, reason };
                }

                ParseState::Headers { status, reason } => {
                    let Some((headers, consumed)) = parse_headers(&self.buffer)? else {
                        return Ok(None);
                    };

                    let status = *status;
                    let reason = reason.clone();
                    let content_length = headers.content_length().unwrap_or(0);
                    self.buffer.drain(..consumed);

                    if content_length == 0 {
                        self.state = ParseState::StatusLine;
                        return Ok(Some(RtspResponse {
                            status,
                            reason,
                            headers,
                            body: Vec::new(),
                        }));
                    }

                    self.state = ParseState::Body {
                        status,
                        reason,
                        headers,
                        content_length,
                    };
                }

                ParseState::Body {
                    status,
                    reason,
                    headers,
                    content_length,
                } => {
                    if self.buffer.len() < *content_length {
                        return Ok(None);
                    }

                    let response = RtspResponse {
                        status: *status,
                        reason: reason.clone(),
                        headers: headers.clone(),
                        body: self.buffer.drain(..*content_length).collect(),
                    };
                    self.state = ParseState::StatusLine;
                    return Ok(Some(response));
                }
            }
        }
    }

    /// Drop buffered bytes and reset, e.g. after a connection switch
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::StatusLine;
    }
}

impl Default for RtspCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

fn parse_status_line(line: &str) -> Result<(StatusCode, String), RtspCodecError> {
    // "RTSP/1.0 200 OK"
    let mut parts = line.splitn(3, ' ');

    let version = parts
        .next()
        .ok_or_else(|| RtspCodecError::InvalidStatusLine(line.to_string()))?;
    if !version.starts_with("RTSP/") {
        return Err(RtspCodecError::InvalidStatusLine(line.to_string()));
    }

    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| RtspCodecError::InvalidStatusLine(line.to_string()))?;

    Ok((StatusCode(status), parts.next().unwrap_or("").to_string()))
}

fn parse_headers(buffer: &[u8]) -> Result<Option<(Headers, usize)>, RtspCodecError> {
    if buffer.starts_with(b"\r\n") {
        return Ok(Some((Headers::new(), 2)));
    }

    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let header_str = String::from_utf8_lossy(&buffer[..header_end]);
    let mut headers = Headers::new();

    for line in header_str.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| RtspCodecError::InvalidHeader(line.to_string()))?;
        headers.insert(line[..colon].trim().to_string(), line[colon + 1..].trim().to_string());
    }

    Ok(Some((headers, header_end + 4)))
}
