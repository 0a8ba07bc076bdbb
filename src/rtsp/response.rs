use super::Headers;

/// RTSP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const CONNECTION_AUTH_REQUIRED: StatusCode = StatusCode(470);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    #[must_use]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

/// A parsed RTSP response
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RtspResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as a binary plist
    pub fn body_as_plist(&self) -> Result<crate::plist::PlistValue, crate::plist::PlistDecodeError> {
        crate::plist::decode(&self.body)
    }

    /// Parse a `text/parameters` body into key/value pairs
    #[must_use]
    pub fn body_as_parameters(&self) -> Vec<(String, String)> {
        String::from_utf8_lossy(&self.body)
            .lines()
            .filter_map(|line| {
                let (k, v) = line.split_once(':')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }
}
