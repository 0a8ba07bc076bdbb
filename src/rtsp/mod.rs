//! Sans-IO RTSP 1.0 client pieces: request builder, response codec and
//! digest auth. AirPlay extends RTSP with a handful of non-standard verbs
//! that appear as plain request-line methods.

pub mod auth;
pub mod codec;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;

#[cfg(test)]
mod tests;

pub use auth::DigestChallenge;
pub use codec::{RtspCodec, RtspCodecError};
pub use headers::Headers;
pub use request::{RtspRequest, RtspRequestBuilder};
pub use response::{RtspResponse, StatusCode};
pub use server::{ParsedRequest, RequestCodec};

/// RTSP methods used by the AirPlay output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Options,
    Setup,
    Record,
    Flush,
    Teardown,
    SetParameter,
    GetParameter,
    Setpeers,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
            Method::Setup => "SETUP",
            Method::Record => "RECORD",
            Method::Flush => "FLUSH",
            Method::Teardown => "TEARDOWN",
            Method::SetParameter => "SET_PARAMETER",
            Method::GetParameter => "GET_PARAMETER",
            Method::Setpeers => "SETPEERS",
        }
    }
}

/// Content types appearing on the AirPlay control connection
pub mod content_types {
    pub const BINARY_PLIST: &str = "application/x-apple-binary-plist";
    pub const OCTET_STREAM: &str = "application/octet-stream";
    pub const PARAMETERS: &str = "text/parameters";
    pub const DMAP: &str = "application/x-dmap-tagged";
    pub const PEER_LIST: &str = "/peer-list-changed";
}
