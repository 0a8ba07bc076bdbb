//! The accessory side of an AirPlay 2 session, faithful enough to drive the
//! real client code end to end: transient and normal pair-setup,
//! pair-verify, ciphered control connection, SETUP/RECORD/SETPEERS handling,
//! a data socket that decrypts received audio, and a control socket that
//! records sync packets and can ask for retransmits.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::crypto::{ChaCha20Poly1305Cipher, Nonce};
use crate::pairing::{Channel, CipherContext, PairSetupServer, PairVerifyServer, Role};
use crate::plist::{DictBuilder, PlistValue};
use crate::rtsp::server::encode_response;
use crate::rtsp::{Headers, ParsedRequest, RequestCodec, StatusCode};
use crate::types::{AudioQuality, DeviceFlags, OutputDevice, PairingMode};

/// Speaker behaviour knobs
#[derive(Debug, Clone)]
pub struct MockSpeakerConfig {
    /// PIN for pair-setup; transient clients use "3939"
    pub pin: String,
    /// Require RFC 2617 digest auth on SETUP (session)
    pub password: Option<String>,
    pub realm: String,
    pub nonce: String,
}

impl Default for MockSpeakerConfig {
    fn default() -> Self {
        Self {
            pin: crate::pairing::TRANSIENT_PIN.to_string(),
            password: None,
            realm: "raop".to_string(),
            nonce: "abc123".to_string(),
        }
    }
}

/// Everything the speaker observed, for test assertions
#[derive(Debug, Default)]
pub struct Recording {
    /// Request lines in arrival order ("SETUP /uri")
    pub requests: Vec<String>,
    /// Volume values from SET_PARAMETER
    pub volumes: Vec<String>,
    /// Decrypted audio payloads with seqnum and marker flag
    pub audio_packets: Vec<(u16, bool, Vec<u8>)>,
    /// Sync packets seen on the control socket (variant, cur_pos, next_pos)
    pub sync_packets: Vec<(u8, u32, u32)>,
    /// TEARDOWN bodies in arrival order (decoded plists)
    pub teardowns: Vec<PlistValue>,
    /// True once pairing completed and the channel turned ciphered
    pub paired: bool,
}

/// A running mock speaker
pub struct MockSpeaker {
    address: SocketAddr,
    recording: Arc<StdMutex<Recording>>,
    control_socket: Arc<UdpSocket>,
    /// Where the last SETUP (stream) told the client we listen, used to
    /// address retransmit requests back at the client control port
    client_control_addr: Arc<StdMutex<Option<SocketAddr>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockSpeaker {
    /// Start a speaker on an ephemeral port
    pub async fn start(config: MockSpeakerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let data_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let control_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let event_listener = TcpListener::bind("127.0.0.1:0").await?;

        let recording = Arc::new(StdMutex::new(Recording::default()));
        let client_control_addr = Arc::new(StdMutex::new(None));

        let task = tokio::spawn(speaker_main(
            listener,
            data_socket,
            control_socket.clone(),
            event_listener,
            config,
            recording.clone(),
            client_control_addr.clone(),
        ));

        Ok(Self {
            address,
            recording,
            control_socket,
            client_control_addr,
            task,
        })
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// A device record describing this speaker, as discovery would build it
    #[must_use]
    pub fn device(&self, pairing_mode: PairingMode) -> OutputDevice {
        OutputDevice {
            id: 0x1122_3344_5566,
            name: "Mock Speaker".to_string(),
            model: "MockAudio1,1".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: self.address.port(),
            auth_key: None,
            volume: 60,
            quality: AudioQuality::default(),
            flags: DeviceFlags::default(),
            pairing_mode,
            supports_ptp: false,
            wants_progress: true,
            wants_text: true,
            wants_artwork: false,
            raw_features: (1 << 9) | (1 << 43),
            password: None,
            pin: None,
        }
    }

    /// Snapshot of the recording
    pub fn recording(&self) -> Recording {
        let guard = self.recording.lock().unwrap_or_else(|e| e.into_inner());
        Recording {
            requests: guard.requests.clone(),
            volumes: guard.volumes.clone(),
            audio_packets: guard.audio_packets.clone(),
            sync_packets: guard.sync_packets.clone(),
            teardowns: guard.teardowns.clone(),
            paired: guard.paired,
        }
    }

    /// Ask the client to retransmit `len` packets starting at `seq_start`.
    /// Sends from our control socket so the control service can match the
    /// peer address.
    pub async fn request_retransmit(
        &self,
        client_control_port: u16,
        cseq: u16,
        seq_start: u16,
        seq_len: u16,
    ) -> std::io::Result<()> {
        let request = crate::rtp::RetransmitRequest {
            cseq,
            seq_start,
            seq_len,
        };
        self.control_socket
            .send_to(
                &request.encode(),
                (Ipv4Addr::LOCALHOST, client_control_port),
            )
            .await?;
        Ok(())
    }

    /// The client-side control address learned from sync packets
    #[must_use]
    pub fn client_control_addr(&self) -> Option<SocketAddr> {
        *self
            .client_control_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

struct SpeakerState {
    config: MockSpeakerConfig,
    recording: Arc<StdMutex<Recording>>,
    data_port: u16,
    control_port: u16,
    event_port: u16,
    setup_server: Option<PairSetupServer>,
    verify_server: Option<PairVerifyServer>,
    /// Accessory long-term signing key, shared between setup and verify
    signing_secret: Option<[u8; 32]>,
    controller_ltpk: Option<Vec<u8>>,
    /// Set right after the pairing response that completes the exchange
    install_cipher_secret: Option<Vec<u8>>,
    shared_secret: Option<Vec<u8>>,
}

#[allow(clippy::too_many_lines)]
async fn speaker_main(
    listener: TcpListener,
    data_socket: Arc<UdpSocket>,
    control_socket: Arc<UdpSocket>,
    event_listener: TcpListener,
    config: MockSpeakerConfig,
    recording: Arc<StdMutex<Recording>>,
    client_control_addr: Arc<StdMutex<Option<SocketAddr>>>,
) {
    let data_port = data_socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let control_port = control_socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let event_port = event_listener.local_addr().map(|a| a.port()).unwrap_or(0);

    // The event listener just accepts and holds connections
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = event_listener.accept().await else {
                return;
            };
            // Keep the connection open; commands are a separate test path
            tokio::spawn(async move {
                let mut stream = stream;
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        return;
                    }
                }
            });
        }
    });

    let mut state = SpeakerState {
        config,
        recording: recording.clone(),
        data_port,
        control_port,
        event_port,
        setup_server: None,
        verify_server: None,
        signing_secret: None,
        controller_ltpk: None,
        install_cipher_secret: None,
        shared_secret: None,
    };

    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        serve_connection(
            stream,
            &mut state,
            &data_socket,
            &control_socket,
            &client_control_addr,
        )
        .await;
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    state: &mut SpeakerState,
    data_socket: &Arc<UdpSocket>,
    control_socket: &Arc<UdpSocket>,
    client_control_addr: &Arc<StdMutex<Option<SocketAddr>>>,
) {
    let mut codec = RequestCodec::new();
    let mut cipher: Option<CipherContext> = None;
    let mut residue: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut receivers_started = false;

    loop {
        while let Ok(Some(request)) = codec.decode() {
            let reply = handle_request(state, &request);

            // Start the UDP receivers once streaming is possible
            if !receivers_started && state.shared_secret.is_some() && request.method == "SETUP" {
                if let Some(secret) = state.shared_secret.clone() {
                    let mut key = [0u8; 32];
                    let n = secret.len().min(32);
                    key[..n].copy_from_slice(&secret[..n]);

                    tokio::spawn(data_receiver(
                        data_socket.clone(),
                        key,
                        state.recording.clone(),
                    ));
                    tokio::spawn(control_receiver(
                        control_socket.clone(),
                        state.recording.clone(),
                        client_control_addr.clone(),
                    ));
                    receivers_started = true;
                }
            }

            let wire = match &mut cipher {
                Some(cipher) => match cipher.encrypt(&reply) {
                    Ok(wire) => wire,
                    Err(_) => return,
                },
                None => reply,
            };
            if stream.write_all(&wire).await.is_err() {
                return;
            }

            // Pairing just completed: all subsequent traffic is ciphered
            if let Some(secret) = state.install_cipher_secret.take() {
                match CipherContext::new(&secret, Channel::Control, Role::Accessory) {
                    Ok(context) => {
                        cipher = Some(context);
                        state
                            .recording
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .paired = true;
                    }
                    Err(_) => return,
                }
            }
        }

        let Ok(n) = stream.read(&mut buf).await else {
            return;
        };
        if n == 0 {
            return;
        }

        match &mut cipher {
            Some(cipher) => {
                residue.extend_from_slice(&buf[..n]);
                let Ok((plain, consumed)) = cipher.decrypt(&residue) else {
                    return;
                };
                residue.drain(..consumed);
                if codec.feed(&plain).is_err() {
                    return;
                }
            }
            None => {
                if codec.feed(&buf[..n]).is_err() {
                    return;
                }
            }
        }
    }
}

fn ok_with_body(request: &ParsedRequest, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut headers = Headers::new();
    if let Some(cseq) = request.headers.cseq() {
        headers.insert("CSeq", cseq.to_string());
    }
    if !body.is_empty() {
        headers.insert("Content-Type", content_type.to_string());
    }
    encode_response(StatusCode::OK, "OK", &headers, &body)
}

fn ok_empty(request: &ParsedRequest) -> Vec<u8> {
    ok_with_body(request, "", Vec::new())
}

#[allow(clippy::too_many_lines)]
fn handle_request(state: &mut SpeakerState, request: &ParsedRequest) -> Vec<u8> {
    state
        .recording
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .requests
        .push(format!("{} {}", request.method, short_uri(&request.uri)));

    match (request.method.as_str(), short_uri(&request.uri)) {
        ("GET", "/info") => {
            let info = DictBuilder::new()
                .insert("deviceID", "11:22:33:44:55:66")
                .insert("model", "MockAudio1,1")
                .insert("statusFlags", 4u32)
                .insert("features", 0x0008_0000_0000_0200_u64)
                .build();
            let body = crate::plist::encode(&info).unwrap_or_default();
            ok_with_body(request, "application/x-apple-binary-plist", body)
        }

        ("POST", "/pair-setup") => {
            if state.setup_server.is_none() {
                let server = PairSetupServer::new("11:22:33:44:55:66", &state.config.pin);
                match server {
                    Ok(server) => {
                        state.signing_secret = Some(server.signing_secret());
                        state.setup_server = Some(server);
                    }
                    Err(_) => return error_response(request),
                }
            }

            let Some(server) = state.setup_server.as_mut() else {
                return error_response(request);
            };
            let reply = server.handle(&request.body);

            if let Some(secret) = server.shared_secret() {
                state.shared_secret = Some(secret.to_vec());
                state.controller_ltpk = server.controller_ltpk().map(<[u8]>::to_vec);

                // Transient setup ends here and switches the channel over;
                // normal setup proceeds to pair-verify in the clear
                if state.controller_ltpk.is_none() {
                    state.install_cipher_secret = Some(secret.to_vec());
                }
                state.setup_server = None;
            }
            ok_with_body(request, "application/octet-stream", reply)
        }

        ("POST", "/pair-verify") => {
            if state.verify_server.is_none() {
                let Some(signing_secret) = state.signing_secret else {
                    return error_response(request);
                };
                state.verify_server = Some(PairVerifyServer::new(
                    "11:22:33:44:55:66",
                    &signing_secret,
                    state.controller_ltpk.clone(),
                ));
            }

            let Some(server) = state.verify_server.as_mut() else {
                return error_response(request);
            };
            let reply = server.handle(&request.body);

            if let Some(secret) = server.shared_secret() {
                state.shared_secret = Some(secret.to_vec());
                state.install_cipher_secret = Some(secret.to_vec());
                state.verify_server = None;
            }
            ok_with_body(request, "application/octet-stream", reply)
        }

        ("POST", "/pair-pin-start") => ok_empty(request),
        ("POST", "/feedback") => ok_empty(request),

        ("SETUP", _) => {
            let plist = crate::plist::decode(&request.body).ok();
            let is_stream_setup = plist
                .as_ref()
                .and_then(|p| p.get("streams"))
                .is_some();

            if is_stream_setup {
                let stream = DictBuilder::new()
                    .insert("dataPort", state.data_port)
                    .insert("controlPort", state.control_port)
                    .insert("type", 96)
                    .build();
                let reply = DictBuilder::new()
                    .insert("streams", PlistValue::Array(vec![stream]))
                    .build();
                let body = crate::plist::encode(&reply).unwrap_or_default();
                ok_with_body(request, "application/x-apple-binary-plist", body)
            } else {
                // Session setup; a password-protected speaker challenges it
                if let Some(password) = &state.config.password {
                    if !digest_is_valid(state, request, password) {
                        return unauthorized_response(state, request);
                    }
                }

                let reply = DictBuilder::new()
                    .insert("eventPort", state.event_port)
                    .insert("timingPort", 0)
                    .build();
                let body = crate::plist::encode(&reply).unwrap_or_default();
                ok_with_body(request, "application/x-apple-binary-plist", body)
            }
        }

        ("RECORD" | "SETPEERS" | "FLUSH", _) => ok_empty(request),

        ("TEARDOWN", _) => {
            if let Ok(plist) = crate::plist::decode(&request.body) {
                state
                    .recording
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .teardowns
                    .push(plist);
            }
            ok_empty(request)
        }

        ("SET_PARAMETER", _) => {
            let body = String::from_utf8_lossy(&request.body);
            if let Some(volume) = body.strip_prefix("volume: ") {
                state
                    .recording
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .volumes
                    .push(volume.trim().to_string());
            }
            ok_empty(request)
        }

        _ => {
            let mut headers = Headers::new();
            if let Some(cseq) = request.headers.cseq() {
                headers.insert("CSeq", cseq.to_string());
            }
            encode_response(StatusCode::NOT_FOUND, "Not Found", &headers, &[])
        }
    }
}

fn short_uri(uri: &str) -> &str {
    // Session URLs look like rtsp://host/id; the path alone identifies them
    if let Some(rest) = uri.strip_prefix("rtsp://") {
        rest.find('/').map_or(uri, |i| &rest[i..])
    } else {
        uri
    }
}

fn error_response(request: &ParsedRequest) -> Vec<u8> {
    let mut headers = Headers::new();
    if let Some(cseq) = request.headers.cseq() {
        headers.insert("CSeq", cseq.to_string());
    }
    encode_response(StatusCode::INTERNAL_ERROR, "Internal Error", &headers, &[])
}

fn unauthorized_response(state: &SpeakerState, request: &ParsedRequest) -> Vec<u8> {
    let mut headers = Headers::new();
    if let Some(cseq) = request.headers.cseq() {
        headers.insert("CSeq", cseq.to_string());
    }
    headers.insert(
        "WWW-Authenticate",
        format!(
            "Digest realm=\"{}\", nonce=\"{}\"",
            state.config.realm, state.config.nonce
        ),
    );
    encode_response(StatusCode::UNAUTHORIZED, "Unauthorized", &headers, &[])
}

fn digest_is_valid(state: &SpeakerState, request: &ParsedRequest, password: &str) -> bool {
    let Some(authorization) = request.headers.get("Authorization") else {
        return false;
    };

    // Verify against the expected RFC 2617 response for our realm/nonce;
    // like real speakers, only the password matters and the username is empty
    let expected = crate::rtsp::DigestChallenge {
        realm: state.config.realm.clone(),
        nonce: state.config.nonce.clone(),
    }
    .authorization("", password, crate::rtsp::Method::Setup, &request.uri);

    let wanted_response = expected
        .split("response=\"")
        .nth(1)
        .and_then(|s| s.split('"').next())
        .unwrap_or("");

    authorization.contains(&format!("response=\"{wanted_response}\""))
}

/// Receives, decrypts and records audio packets
async fn data_receiver(
    socket: Arc<UdpSocket>,
    key: [u8; 32],
    recording: Arc<StdMutex<Recording>>,
) {
    let Ok(cipher) = ChaCha20Poly1305Cipher::new(&key) else {
        return;
    };
    let mut buf = [0u8; 4096];

    loop {
        let Ok((len, _)) = socket.recv_from(&mut buf).await else {
            return;
        };
        if len < 12 + 16 + 8 {
            continue;
        }

        let packet = &buf[..len];
        let header = &packet[..12];
        let seqnum = u16::from_be_bytes([header[2], header[3]]);
        let marker = header[1] & 0x80 != 0;

        let ciphertext_end = len - 16 - 8;
        let mut payload = packet[12..ciphertext_end].to_vec();
        let tag = &packet[ciphertext_end..ciphertext_end + 16];

        let nonce = Nonce::from_seqnum(seqnum);
        if cipher
            .decrypt_detached(&nonce, &header[4..12], &mut payload, tag)
            .is_err()
        {
            continue;
        }

        recording
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .audio_packets
            .push((seqnum, marker, payload));
    }
}

/// Records sync packets and remembers where the client sends from
async fn control_receiver(
    socket: Arc<UdpSocket>,
    recording: Arc<StdMutex<Recording>>,
    client_control_addr: Arc<StdMutex<Option<SocketAddr>>>,
) {
    let mut buf = [0u8; 64];

    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        *client_control_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);

        if len == 20 && buf[1] == 0xd4 {
            let cur = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let next = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
            recording
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sync_packets
                .push((buf[0], cur, next));
        }
    }
}
