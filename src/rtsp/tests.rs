use super::*;

#[test]
fn request_encode_carries_airplay_headers() {
    let request = RtspRequest::builder(Method::Setup, "rtsp://192.168.1.10/3840192381")
        .cseq(4)
        .user_agent("tonecast/0.1")
        .header(headers::names::DACP_ID, "8F28E2A5C1D9F1AA")
        .header(headers::names::ACTIVE_REMOTE, "3251245098")
        .build();

    let encoded = request.encode();
    let text = String::from_utf8_lossy(&encoded);

    assert!(text.starts_with("SETUP rtsp://192.168.1.10/3840192381 RTSP/1.0\r\n"));
    assert!(text.contains("CSeq: 4\r\n"));
    assert!(text.contains("DACP-ID: 8F28E2A5C1D9F1AA\r\n"));
    assert!(text.contains("Active-Remote: 3251245098\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[test]
fn request_encode_with_body_adds_content_length() {
    let request = RtspRequest::builder(Method::SetParameter, "rtsp://x/1")
        .cseq(9)
        .content_type(content_types::PARAMETERS)
        .body(b"volume: -14.5\r\n".to_vec())
        .build();

    let text = String::from_utf8_lossy(&request.encode()).to_string();
    assert!(text.contains("Content-Type: text/parameters\r\n"));
    assert!(text.contains("Content-Length: 15\r\n"));
    assert!(text.ends_with("volume: -14.5\r\n"));
}

#[test]
fn setpeers_is_a_plain_verb() {
    let request = RtspRequest::builder(Method::Setpeers, "rtsp://x/1").cseq(1).build();
    assert!(request.encode().starts_with(b"SETPEERS "));
}

#[test]
fn codec_parses_single_response() {
    let mut codec = RtspCodec::new();
    codec
        .feed(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();

    let response = codec.decode().unwrap().expect("complete response");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers.cseq(), Some(3));
    assert_eq!(response.body, b"hello");
    assert!(codec.decode().unwrap().is_none());
}

#[test]
fn codec_handles_split_feeds() {
    let mut codec = RtspCodec::new();
    let wire = b"RTSP/1.0 200 OK\r\nContent-Length: 4\r\n\r\nabcd";

    for chunk in wire.chunks(3) {
        codec.feed(chunk).unwrap();
    }

    // Everything fed; one decode sweep finds the response
    let response = codec.decode().unwrap().expect("complete response");
    assert_eq!(response.body, b"abcd");
}

#[test]
fn codec_parses_back_to_back_responses() {
    let mut codec = RtspCodec::new();
    codec
        .feed(b"RTSP/1.0 200 OK\r\n\r\nRTSP/1.0 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"raop\", nonce=\"abc123\"\r\n\r\n")
        .unwrap();

    let first = codec.decode().unwrap().unwrap();
    assert_eq!(first.status, StatusCode::OK);

    let second = codec.decode().unwrap().unwrap();
    assert_eq!(second.status, StatusCode::UNAUTHORIZED);
    let challenge =
        DigestChallenge::parse(second.headers.get(headers::names::WWW_AUTHENTICATE).unwrap())
            .unwrap();
    assert_eq!(challenge.realm, "raop");
    assert_eq!(challenge.nonce, "abc123");
}

#[test]
fn codec_rejects_http_status_line() {
    let mut codec = RtspCodec::new();
    codec.feed(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
    assert!(codec.decode().is_err());
}

#[test]
fn response_parameters_body() {
    let response = RtspResponse {
        status: StatusCode::OK,
        reason: "OK".into(),
        headers: Headers::new(),
        body: b"volume: -20.0\r\n".to_vec(),
    };

    let params = response.body_as_parameters();
    assert_eq!(params, vec![("volume".to_string(), "-20.0".to_string())]);
}

#[test]
fn headers_are_case_insensitive() {
    let mut headers = Headers::new();
    headers.insert("content-length", "10");
    assert_eq!(headers.content_length(), Some(10));

    headers.insert("Content-Length", "20");
    assert_eq!(headers.content_length(), Some(20));
    assert_eq!(headers.iter().count(), 1);
}
