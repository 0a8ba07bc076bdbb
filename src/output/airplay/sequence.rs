//! The fifteen RTSP request sequences a device session can run, as static
//! step tables. A step names its method, URI, content type and two hooks:
//! the payload builder (which may skip the step or abort the sequence) and
//! the response handler (which may jump to another sequence).

use crate::output::{Metadata, OutputStatus};
use crate::pairing::{PairSetup, PairVerify, PairingKeys, SetupMode};
use crate::plist::{DictBuilder, PlistValue};
use crate::rtsp::{DigestChallenge, Method, RtspResponse, StatusCode, content_types};
use crate::types::{OutputConfig, OutputDevice, PairingMode};

/// Device status flags from the `/info` reply
pub mod status_flags {
    pub const PROBLEM_DETECTED: u64 = 1 << 0;
    pub const NOT_CONFIGURED: u64 = 1 << 1;
    pub const AUDIO_CABLE_ATTACHED: u64 = 1 << 2;
    pub const PIN_REQUIRED: u64 = 1 << 3;
    pub const PASSWORD_REQUIRED: u64 = 1 << 7;
    pub const ONE_TIME_PAIRING_REQUIRED: u64 = 1 << 9;
}

/// The protocol state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Stopped,
    Info,
    /// Waiting for the user to enter a PIN
    Auth,
    Encrypted,
    Setup,
    Record,
    Connected,
    Streaming,
    Teardown,
    Failed,
}

impl ProtoState {
    /// The status the player sees for this state
    #[must_use]
    pub fn as_status(self) -> OutputStatus {
        match self {
            ProtoState::Stopped | ProtoState::Teardown => OutputStatus::Stopped,
            ProtoState::Auth => OutputStatus::RequiresPassword,
            ProtoState::Info | ProtoState::Encrypted | ProtoState::Setup | ProtoState::Record => {
                OutputStatus::Startup
            }
            ProtoState::Connected => OutputStatus::Connected,
            ProtoState::Streaming => OutputStatus::Streaming,
            ProtoState::Failed => OutputStatus::Failed,
        }
    }
}

/// The sequence kinds. One public operation maps to one of these; pairing
/// sequences are entered from the `/info` response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqType {
    Start,
    StartPlayback,
    Probe,
    Flush,
    Stop,
    Failure,
    PinStart,
    SendVolume,
    SendText,
    SendProgress,
    SendArtwork,
    PairSetup,
    PairVerify,
    PairTransient,
    Feedback,
}

/// What the payload builder decided
pub enum BuildResult {
    /// Send the step with this body and extra headers
    Send {
        body: Vec<u8>,
        headers: Vec<(&'static str, String)>,
    },
    /// The step does not apply; move to the next one
    Skip,
    /// Stop the whole sequence
    Abort,
}

impl BuildResult {
    fn body(body: Vec<u8>) -> Self {
        Self::Send {
            body,
            headers: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self::body(Vec::new())
    }
}

/// What the response handler decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNext {
    Continue,
    Abort,
    /// Leave this sequence and start another
    Start(SeqType),
}

type PayloadFn = fn(&mut SessionCtx) -> BuildResult;
type HandlerFn = fn(&mut SessionCtx, &RtspResponse) -> SeqNext;

/// One request of a sequence
pub struct SeqStep {
    pub name: &'static str,
    pub method: Method,
    /// Absolute URI; `None` uses the session URL
    pub uri: Option<&'static str>,
    pub content_type: Option<&'static str>,
    pub payload: Option<PayloadFn>,
    pub handler: Option<HandlerFn>,
    /// Pass non-2xx replies to the handler instead of aborting
    pub proceed_on_non_ok: bool,
}

/// The step table for a sequence
#[must_use]
pub fn steps(seq: SeqType) -> &'static [SeqStep] {
    match seq {
        SeqType::Start => &[SeqStep {
            name: "GET /info",
            method: Method::Get,
            uri: Some("/info"),
            content_type: None,
            payload: None,
            handler: Some(handler_info_start),
            proceed_on_non_ok: false,
        }],
        SeqType::StartPlayback => &[
            // proceed_on_non_ok because a 401 with WWW-Authenticate re-arms
            // the sequence with a digest header
            SeqStep {
                name: "SETUP (session)",
                method: Method::Setup,
                uri: None,
                content_type: Some(content_types::BINARY_PLIST),
                payload: Some(payload_setup_session),
                handler: Some(handler_setup_session),
                proceed_on_non_ok: true,
            },
            SeqStep {
                name: "RECORD",
                method: Method::Record,
                uri: None,
                content_type: None,
                payload: Some(payload_record),
                handler: Some(handler_record),
                proceed_on_non_ok: false,
            },
            SeqStep {
                name: "SETPEERS",
                method: Method::Setpeers,
                uri: None,
                content_type: Some(content_types::PEER_LIST),
                payload: Some(payload_setpeers),
                handler: None,
                proceed_on_non_ok: false,
            },
            SeqStep {
                name: "SETUP (stream)",
                method: Method::Setup,
                uri: None,
                content_type: Some(content_types::BINARY_PLIST),
                payload: Some(payload_setup_stream),
                handler: Some(handler_setup_stream),
                proceed_on_non_ok: false,
            },
            // Some devices (e.g. Sonos Symfonisk) only register the volume
            // when it comes last
            SeqStep {
                name: "SET_PARAMETER (volume)",
                method: Method::SetParameter,
                uri: None,
                content_type: Some(content_types::PARAMETERS),
                payload: Some(payload_set_volume),
                handler: None,
                proceed_on_non_ok: true,
            },
        ],
        SeqType::Probe => &[SeqStep {
            name: "GET /info (probe)",
            method: Method::Get,
            uri: Some("/info"),
            content_type: None,
            payload: None,
            handler: Some(handler_info_probe),
            proceed_on_non_ok: false,
        }],
        SeqType::Flush => &[SeqStep {
            name: "FLUSH",
            method: Method::Flush,
            uri: None,
            content_type: None,
            payload: Some(payload_flush),
            handler: Some(handler_flush),
            proceed_on_non_ok: false,
        }],
        SeqType::Stop => &[SeqStep {
            name: "TEARDOWN",
            method: Method::Teardown,
            uri: None,
            content_type: Some(content_types::BINARY_PLIST),
            payload: Some(payload_teardown_stream),
            handler: Some(handler_teardown),
            proceed_on_non_ok: true,
        }],
        SeqType::Failure => &[SeqStep {
            name: "TEARDOWN (failure)",
            method: Method::Teardown,
            uri: None,
            content_type: Some(content_types::BINARY_PLIST),
            payload: Some(payload_teardown_final),
            handler: Some(handler_teardown_failure),
            proceed_on_non_ok: false,
        }],
        SeqType::PinStart => &[SeqStep {
            name: "PIN start",
            method: Method::Post,
            uri: Some("/pair-pin-start"),
            content_type: None,
            payload: None,
            handler: Some(handler_pin_start),
            proceed_on_non_ok: false,
        }],
        SeqType::SendVolume => &[SeqStep {
            name: "SET_PARAMETER (volume)",
            method: Method::SetParameter,
            uri: None,
            content_type: Some(content_types::PARAMETERS),
            payload: Some(payload_set_volume),
            handler: None,
            proceed_on_non_ok: true,
        }],
        SeqType::SendText => &[SeqStep {
            name: "SET_PARAMETER (text)",
            method: Method::SetParameter,
            uri: None,
            content_type: Some(content_types::DMAP),
            payload: Some(payload_send_text),
            handler: None,
            proceed_on_non_ok: true,
        }],
        SeqType::SendProgress => &[SeqStep {
            name: "SET_PARAMETER (progress)",
            method: Method::SetParameter,
            uri: None,
            content_type: Some(content_types::PARAMETERS),
            payload: Some(payload_send_progress),
            handler: None,
            proceed_on_non_ok: true,
        }],
        SeqType::SendArtwork => &[SeqStep {
            name: "SET_PARAMETER (artwork)",
            method: Method::SetParameter,
            uri: None,
            content_type: None,
            payload: Some(payload_send_artwork),
            handler: None,
            proceed_on_non_ok: true,
        }],
        SeqType::PairSetup => &[
            SeqStep {
                name: "pair setup 1",
                method: Method::Post,
                uri: Some("/pair-setup"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_setup1),
                handler: Some(handler_pair_setup1),
                proceed_on_non_ok: false,
            },
            SeqStep {
                name: "pair setup 2",
                method: Method::Post,
                uri: Some("/pair-setup"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_setup2),
                handler: Some(handler_pair_setup2),
                proceed_on_non_ok: false,
            },
            SeqStep {
                name: "pair setup 3",
                method: Method::Post,
                uri: Some("/pair-setup"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_setup3),
                handler: Some(handler_pair_setup3),
                proceed_on_non_ok: false,
            },
        ],
        SeqType::PairVerify => &[
            // proceed on error so the handler can drop a stale device key
            SeqStep {
                name: "pair verify 1",
                method: Method::Post,
                uri: Some("/pair-verify"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_verify1),
                handler: Some(handler_pair_verify1),
                proceed_on_non_ok: true,
            },
            SeqStep {
                name: "pair verify 2",
                method: Method::Post,
                uri: Some("/pair-verify"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_verify2),
                handler: Some(handler_pair_verify2),
                proceed_on_non_ok: false,
            },
        ],
        // Transient runs the first two setup messages only; a 470 is passed
        // through so the handler can fall back to PIN setup
        SeqType::PairTransient => &[
            SeqStep {
                name: "pair setup 1",
                method: Method::Post,
                uri: Some("/pair-setup"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_setup1),
                handler: Some(handler_pair_setup1),
                proceed_on_non_ok: true,
            },
            SeqStep {
                name: "pair setup 2",
                method: Method::Post,
                uri: Some("/pair-setup"),
                content_type: Some(content_types::OCTET_STREAM),
                payload: Some(payload_pair_setup2),
                handler: Some(handler_pair_setup2),
                proceed_on_non_ok: false,
            },
        ],
        SeqType::Feedback => &[SeqStep {
            name: "POST /feedback",
            method: Method::Post,
            uri: Some("/feedback"),
            content_type: None,
            payload: None,
            handler: None,
            proceed_on_non_ok: true,
        }],
    }
}

/// The follow-up sequence when a completed sequence did not jump anywhere
#[must_use]
pub fn follow_up(seq: SeqType) -> Option<SeqType> {
    match seq {
        // Pairing succeeded: proceed to playback setup
        SeqType::PairTransient | SeqType::PairVerify => Some(SeqType::StartPlayback),
        _ => None,
    }
}

/// Everything the payload builders and response handlers read and write.
/// The connection actor owns it for the lifetime of the session.
pub struct SessionCtx {
    pub device: OutputDevice,
    pub config: OutputConfig,
    pub state: ProtoState,

    /// 32-bit session id, also the streamConnectionID
    pub session_id: u32,
    pub session_uuid: String,
    pub group_uuid: String,
    /// `rtsp://<local addr>/<session id>`, the URI of session-scoped requests
    pub session_url: String,
    /// Our pairing/client id: the library hash in hex
    pub client_id: String,

    /// Local address of the control connection
    pub local_address: Option<std::net::IpAddr>,
    /// Ports of the shared services
    pub timing_port: u16,
    pub control_svc_port: u16,

    pub use_ptp: bool,
    pub clock_id: u64,

    /// statusFlags from /info
    pub statusflags: u64,

    pub pair_setup: Option<PairSetup>,
    pub pair_verify: Option<PairVerify>,
    /// Secret waiting to be installed as the control cipher
    pub pending_secret: Option<Vec<u8>>,
    /// First 32 bytes of the shared secret, the audio key
    pub shared_secret: Vec<u8>,
    /// Keys to persist after a normal pair-setup
    pub keys_to_persist: Option<PairingKeys>,
    /// User PIN for normal pair-setup
    pub pin: Option<String>,

    /// Digest auth state for password devices
    pub digest: Option<DigestChallenge>,
    pub req_has_auth: bool,

    /// Negotiated ports from the SETUP replies
    pub events_port: u16,
    pub data_port: u16,
    pub control_port: u16,

    /// RTP state snapshot for FLUSH (taken from the master session)
    pub flush_seqnum: u16,
    pub flush_rtptime: u32,

    pub volume: i32,
    pub metadata: Metadata,
    /// Clear the ipv6 address preference persistently
    pub ipv6_failed: bool,
}

impl SessionCtx {
    #[must_use]
    pub fn new(device: OutputDevice, config: OutputConfig, use_ptp: bool, clock_id: u64) -> Self {
        let session_id: u32 = rand::random();
        let volume = device.volume;

        Self {
            device,
            config: config.clone(),
            state: ProtoState::Stopped,
            session_id,
            session_uuid: uuid_from(u64::from(session_id) << 32 | 0x1234),
            group_uuid: uuid_from(config.library_id),
            session_url: String::new(),
            client_id: format!("{:016X}", config.library_id),
            local_address: None,
            timing_port: 0,
            control_svc_port: 0,
            use_ptp,
            clock_id,
            statusflags: 0,
            pair_setup: None,
            pair_verify: None,
            pending_secret: None,
            shared_secret: Vec::new(),
            keys_to_persist: None,
            pin: None,
            digest: None,
            req_has_auth: false,
            events_port: 0,
            data_port: 0,
            control_port: 0,
            flush_seqnum: 0,
            flush_rtptime: 0,
            volume,
            metadata: Metadata::default(),
            ipv6_failed: false,
        }
    }

    /// Set once the TCP connection is up and the local address is known.
    /// The session URL names the device, not us.
    pub fn session_ids_set(&mut self, local: std::net::IpAddr) {
        self.local_address = Some(local);
        let device_addr = self
            .device
            .preferred_address()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.session_url = format!("rtsp://{device_addr}/{}", self.session_id);
    }

    /// The device id in the aa:bb:cc:dd:ee:ff form plists want
    #[must_use]
    pub fn device_id_colon(&self) -> String {
        let b = self.device.id.to_be_bytes();
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }

    fn audio_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        let n = self.shared_secret.len().min(32);
        key[..n].copy_from_slice(&self.shared_secret[..n]);
        key
    }
}

fn uuid_from(seed: u64) -> String {
    // Shaped like a UUID; derived from the seed so it is stable per library
    let hi = seed;
    let lo = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    format!(
        "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
        (hi >> 32) as u32,
        (hi >> 16) & 0xffff,
        hi & 0xffff,
        (lo >> 48) & 0xffff,
        lo & 0xffff_ffff_ffff
    )
}

/* ------------------------------ Payloads --------------------------------- */

fn payload_setup_session(ctx: &mut SessionCtx) -> BuildResult {
    let plist = if ctx.use_ptp {
        let mut addresses = Vec::new();
        if let Some(local) = ctx.local_address {
            addresses.push(PlistValue::from(local.to_string()));
        }

        // The plist integer is signed; large clock ids come out negative
        #[allow(clippy::cast_possible_wrap)]
        let clock_id = ctx.clock_id as i64;

        let peer_info = DictBuilder::new()
            .insert("ID", uuid_from(ctx.clock_id))
            .insert("DeviceType", 0)
            .insert("ClockID", clock_id)
            .insert("SupportsClockPortMatchingOverride", false)
            .insert("Addresses", PlistValue::Array(addresses))
            .build();

        DictBuilder::new()
            .insert("name", ctx.config.name.clone())
            .insert("deviceID", ctx.device_id_colon())
            .insert("sessionUUID", ctx.session_uuid.clone())
            .insert("timingProtocol", "PTP")
            .insert("groupUUID", ctx.group_uuid.clone())
            .insert("groupContainsGroupLeader", false)
            .insert("timingPeerInfo", peer_info.clone())
            .insert("timingPeerList", PlistValue::Array(vec![peer_info]))
            .build()
    } else {
        DictBuilder::new()
            .insert("deviceID", ctx.device_id_colon())
            .insert("sessionUUID", ctx.session_uuid.clone())
            .insert("timingPort", ctx.timing_port)
            // "None" makes an ATV4 ignore the stream SETUP
            .insert("timingProtocol", "NTP")
            .build()
    };

    match crate::plist::encode(&plist) {
        Ok(body) => BuildResult::body(body),
        Err(e) => {
            tracing::error!("SETUP session plist encode failed: {e}");
            BuildResult::Abort
        }
    }
}

fn payload_record(_ctx: &mut SessionCtx) -> BuildResult {
    BuildResult::empty()
}

fn payload_setpeers(ctx: &mut SessionCtx) -> BuildResult {
    let mut peers = vec![PlistValue::from(
        ctx.device
            .preferred_address()
            .map(|a| a.to_string())
            .unwrap_or_default(),
    )];
    if let Some(local) = ctx.local_address {
        peers.push(PlistValue::from(local.to_string()));
    }

    match crate::plist::encode(&PlistValue::Array(peers)) {
        Ok(body) => BuildResult::body(body),
        Err(e) => {
            tracing::error!("SETPEERS plist encode failed: {e}");
            BuildResult::Abort
        }
    }
}

fn payload_setup_stream(ctx: &mut SessionCtx) -> BuildResult {
    let stream = DictBuilder::new()
        // 0x40000: ALAC/44100/16/2
        .insert("audioFormat", 0x40000)
        .insert("audioMode", "default")
        .insert("controlPort", ctx.control_svc_port)
        // Compression type 2 = ALAC
        .insert("ct", 2)
        .insert("isMedia", true)
        .insert("latencyMax", 88200)
        .insert("latencyMin", 11025)
        .insert("shk", PlistValue::Data(ctx.audio_key().to_vec()))
        .insert("spf", crate::alac::SAMPLES_PER_PACKET)
        .insert("sr", ctx.device.quality.sample_rate)
        .insert("type", u32::from(crate::rtp::PAYLOAD_TYPE_AUDIO))
        .insert("supportsDynamicStreamID", false)
        .insert("streamConnectionID", ctx.session_id)
        .build();

    let root = DictBuilder::new()
        .insert("streams", PlistValue::Array(vec![stream]))
        .build();

    match crate::plist::encode(&root) {
        Ok(body) => BuildResult::body(body),
        Err(e) => {
            tracing::error!("SETUP stream plist encode failed: {e}");
            BuildResult::Abort
        }
    }
}

fn payload_set_volume(ctx: &mut SessionCtx) -> BuildResult {
    let db = crate::output::volume_to_db(ctx.volume, ctx.config.max_volume);
    BuildResult::body(format!("volume: {db:.6}\r\n").into_bytes())
}

fn payload_send_text(ctx: &mut SessionCtx) -> BuildResult {
    match &ctx.metadata.text {
        Some(text) => BuildResult::body(text.clone()),
        None => BuildResult::Skip,
    }
}

fn payload_send_progress(ctx: &mut SessionCtx) -> BuildResult {
    match ctx.metadata.progress {
        Some(p) => {
            BuildResult::body(format!("progress: {}/{}/{}\r\n", p.start, p.current, p.end).into_bytes())
        }
        None => BuildResult::Skip,
    }
}

fn payload_send_artwork(ctx: &mut SessionCtx) -> BuildResult {
    match &ctx.metadata.artwork {
        Some((data, mime)) => BuildResult::Send {
            body: data.clone(),
            headers: vec![("Content-Type", (*mime).to_string())],
        },
        None => BuildResult::Skip,
    }
}

fn payload_flush(ctx: &mut SessionCtx) -> BuildResult {
    BuildResult::Send {
        body: Vec::new(),
        headers: vec![(
            "RTP-Info",
            format!("seq={};rtptime={}", ctx.flush_seqnum, ctx.flush_rtptime),
        )],
    }
}

/// First TEARDOWN names the stream being stopped
fn payload_teardown_stream(ctx: &mut SessionCtx) -> BuildResult {
    ctx.state = ProtoState::Teardown;

    let stream = DictBuilder::new()
        .insert("streamID", ctx.session_id)
        .build();
    let root = DictBuilder::new()
        .insert("streams", PlistValue::Array(vec![stream]))
        .build();

    match crate::plist::encode(&root) {
        Ok(body) => BuildResult::body(body),
        Err(_) => BuildResult::Abort,
    }
}

/// Final TEARDOWN carries an empty plist
fn payload_teardown_final(ctx: &mut SessionCtx) -> BuildResult {
    ctx.state = ProtoState::Teardown;

    match crate::plist::encode(&DictBuilder::new().build()) {
        Ok(body) => BuildResult::body(body),
        Err(_) => BuildResult::Abort,
    }
}

fn payload_pair_setup1(ctx: &mut SessionCtx) -> BuildResult {
    let mode = match ctx.device.pairing_mode {
        PairingMode::Transient => SetupMode::Transient,
        PairingMode::Normal => SetupMode::Normal,
        PairingMode::Unsupported => return BuildResult::Abort,
    };

    let pin = ctx.pin.clone().unwrap_or_default();
    let mut setup = PairSetup::new(mode, &ctx.client_id, &pin);
    match setup.request1() {
        Ok(body) => {
            ctx.pair_setup = Some(setup);
            BuildResult::body(body)
        }
        Err(e) => {
            tracing::error!("pair-setup M1 failed: {e}");
            BuildResult::Abort
        }
    }
}

fn payload_pair_setup2(ctx: &mut SessionCtx) -> BuildResult {
    match ctx.pair_setup.as_mut().map(PairSetup::request2) {
        Some(Ok(body)) => BuildResult::body(body),
        _ => BuildResult::Abort,
    }
}

fn payload_pair_setup3(ctx: &mut SessionCtx) -> BuildResult {
    match ctx.pair_setup.as_mut().map(PairSetup::request3) {
        Some(Ok(body)) => BuildResult::body(body),
        _ => BuildResult::Abort,
    }
}

fn payload_pair_verify1(ctx: &mut SessionCtx) -> BuildResult {
    let Some(auth_key) = ctx.device.auth_key.as_deref() else {
        return BuildResult::Abort;
    };
    let Some(keys) = PairingKeys::from_auth_string(auth_key) else {
        tracing::warn!("stored auth key for '{}' is invalid", ctx.device.name);
        return BuildResult::Abort;
    };

    let mut verify = PairVerify::new(&ctx.client_id, keys);
    match verify.request1() {
        Ok(body) => {
            ctx.pair_verify = Some(verify);
            BuildResult::body(body)
        }
        Err(e) => {
            tracing::error!("pair-verify M1 failed: {e}");
            BuildResult::Abort
        }
    }
}

fn payload_pair_verify2(ctx: &mut SessionCtx) -> BuildResult {
    match ctx.pair_verify.as_mut().map(PairVerify::request2) {
        Some(Ok(body)) => BuildResult::body(body),
        _ => BuildResult::Abort,
    }
}

/* ------------------------------ Handlers --------------------------------- */

fn parse_info(ctx: &mut SessionCtx, response: &RtspResponse) -> Result<(), ()> {
    let plist = response.body_as_plist().map_err(|e| {
        tracing::warn!("could not parse /info reply from '{}': {e}", ctx.device.name);
    })?;

    if let Some(flags) = plist.get("statusFlags").and_then(PlistValue::as_u64) {
        ctx.statusflags = flags;
    }

    tracing::debug!(
        "status flags from '{}': {:#x} (pin {}, password {}, one-time pairing {})",
        ctx.device.name,
        ctx.statusflags,
        ctx.statusflags & status_flags::PIN_REQUIRED != 0,
        ctx.statusflags & status_flags::PASSWORD_REQUIRED != 0,
        ctx.statusflags & status_flags::ONE_TIME_PAIRING_REQUIRED != 0,
    );
    Ok(())
}

/// Decide the pairing path from `/info`
fn handler_info_start(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    if parse_info(ctx, response).is_err() {
        return SeqNext::Abort;
    }
    ctx.state = ProtoState::Info;

    if ctx.statusflags & status_flags::ONE_TIME_PAIRING_REQUIRED != 0 {
        ctx.device.pairing_mode = PairingMode::Normal;
        if ctx.device.auth_key.is_none() {
            ctx.device.flags.requires_auth = true;
            ctx.state = ProtoState::Auth;
            return SeqNext::Start(SeqType::PinStart);
        }
        return SeqNext::Start(SeqType::PairVerify);
    }

    if ctx.statusflags & status_flags::PIN_REQUIRED != 0 {
        // A stored key is useless now, the device wants a fresh PIN pairing
        ctx.device.auth_key = None;
        ctx.device.flags.requires_auth = true;
        ctx.device.pairing_mode = PairingMode::Normal;

        if ctx.pin.is_some() {
            return SeqNext::Start(SeqType::PairSetup);
        }
        ctx.state = ProtoState::Auth;
        return SeqNext::Start(SeqType::PinStart);
    }

    if ctx.statusflags & status_flags::PASSWORD_REQUIRED != 0 {
        ctx.device.pairing_mode = PairingMode::Normal;
        if ctx.device.password.is_none() {
            tracing::error!(
                "'{}' requires password authentication, but none configured",
                ctx.device.name
            );
            return SeqNext::Abort;
        }
        if ctx.device.auth_key.is_none() {
            ctx.state = ProtoState::Auth;
            return SeqNext::Start(SeqType::PairSetup);
        }
        return SeqNext::Start(SeqType::PairVerify);
    }

    match ctx.device.pairing_mode {
        PairingMode::Transient => SeqNext::Start(SeqType::PairTransient),
        PairingMode::Normal if ctx.device.auth_key.is_some() => {
            SeqNext::Start(SeqType::PairVerify)
        }
        PairingMode::Normal if ctx.pin.is_some() => SeqNext::Start(SeqType::PairSetup),
        PairingMode::Normal => {
            ctx.state = ProtoState::Auth;
            SeqNext::Start(SeqType::PinStart)
        }
        PairingMode::Unsupported => {
            tracing::error!("'{}' advertises no supported pairing", ctx.device.name);
            SeqNext::Abort
        }
    }
}

/// Probing stops after /info; no pairing, no playback
fn handler_info_probe(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    if parse_info(ctx, response).is_err() {
        return SeqNext::Abort;
    }

    if ctx.statusflags & (status_flags::PIN_REQUIRED | status_flags::ONE_TIME_PAIRING_REQUIRED) != 0
        && ctx.device.auth_key.is_none()
    {
        ctx.device.flags.requires_auth = true;
    }
    SeqNext::Continue
}

fn handler_setup_session(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    if response.status == StatusCode::UNAUTHORIZED {
        if ctx.req_has_auth {
            tracing::error!("bad or missing password for '{}'", ctx.device.name);
            return SeqNext::Abort;
        }

        let Some(challenge) = response
            .headers
            .get(crate::rtsp::headers::names::WWW_AUTHENTICATE)
            .and_then(DigestChallenge::parse)
        else {
            return SeqNext::Abort;
        };
        if ctx.device.password.is_none() {
            return SeqNext::Abort;
        }

        // Re-run the whole playback sequence, this time with an
        // Authorization header on every request
        ctx.digest = Some(challenge);
        return SeqNext::Start(SeqType::StartPlayback);
    }

    if !response.is_success() {
        return SeqNext::Abort;
    }

    let Ok(plist) = response.body_as_plist() else {
        return SeqNext::Abort;
    };

    ctx.events_port = plist
        .get("eventPort")
        .and_then(PlistValue::as_u64)
        .unwrap_or(0) as u16;
    if ctx.events_port == 0 {
        tracing::error!("SETUP reply from '{}' is missing the event port", ctx.device.name);
        return SeqNext::Abort;
    }

    ctx.state = ProtoState::Setup;
    SeqNext::Continue
}

fn handler_record(ctx: &mut SessionCtx, _response: &RtspResponse) -> SeqNext {
    ctx.state = ProtoState::Record;
    SeqNext::Continue
}

fn handler_setup_stream(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    let Ok(plist) = response.body_as_plist() else {
        return SeqNext::Abort;
    };

    let stream = plist
        .get("streams")
        .and_then(PlistValue::as_array)
        .and_then(<[PlistValue]>::first);
    let Some(stream) = stream else {
        tracing::error!("missing streams in SETUP reply from '{}'", ctx.device.name);
        return SeqNext::Abort;
    };

    ctx.data_port = stream
        .get("dataPort")
        .and_then(PlistValue::as_u64)
        .unwrap_or(0) as u16;
    ctx.control_port = stream
        .get("controlPort")
        .and_then(PlistValue::as_u64)
        .unwrap_or(0) as u16;

    if ctx.data_port == 0 || ctx.control_port == 0 {
        tracing::error!(
            "missing port number in SETUP reply from '{}' (d={}, c={})",
            ctx.device.name,
            ctx.data_port,
            ctx.control_port
        );
        return SeqNext::Abort;
    }

    tracing::debug!(
        "negotiated UDP session with '{}': d={} c={} e={}",
        ctx.device.name,
        ctx.data_port,
        ctx.control_port,
        ctx.events_port
    );
    SeqNext::Continue
}

fn handler_flush(ctx: &mut SessionCtx, _response: &RtspResponse) -> SeqNext {
    // Back to connected; the next write re-runs the join sync
    ctx.state = ProtoState::Connected;
    SeqNext::Continue
}

fn handler_teardown(ctx: &mut SessionCtx, _response: &RtspResponse) -> SeqNext {
    ctx.state = ProtoState::Stopped;
    SeqNext::Continue
}

fn handler_teardown_failure(ctx: &mut SessionCtx, _response: &RtspResponse) -> SeqNext {
    ctx.state = ProtoState::Failed;
    SeqNext::Continue
}

fn handler_pin_start(ctx: &mut SessionCtx, _response: &RtspResponse) -> SeqNext {
    tracing::info!(
        "pairing started for '{}': device is displaying a PIN",
        ctx.device.name
    );
    ctx.state = ProtoState::Auth;
    SeqNext::Continue
}

fn pair_failed(ctx: &mut SessionCtx, what: &str, e: &crate::pairing::PairingError) -> SeqNext {
    tracing::error!("{what} with '{}' failed: {e}", ctx.device.name);
    ctx.state = ProtoState::Failed;
    SeqNext::Abort
}

fn handler_pair_setup1(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    // An ATV4 answers 470 to a transient attempt; fall back to PIN pairing
    if response.status == StatusCode::CONNECTION_AUTH_REQUIRED {
        ctx.device.pairing_mode = PairingMode::Normal;
        ctx.device.flags.requires_auth = true;
        ctx.pair_setup = None;
        ctx.state = ProtoState::Auth;
        return SeqNext::Start(SeqType::PinStart);
    }
    if !response.is_success() {
        return SeqNext::Abort;
    }

    let result = match ctx.pair_setup.as_mut() {
        Some(setup) => setup.response1(&response.body),
        None => return SeqNext::Abort,
    };
    match result {
        Ok(()) => SeqNext::Continue,
        Err(e) => pair_failed(ctx, "pair-setup M2", &e),
    }
}

fn handler_pair_setup2(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    let result = match ctx.pair_setup.as_mut() {
        Some(setup) => setup.response2(&response.body),
        None => return SeqNext::Abort,
    };
    if let Err(e) = result {
        return pair_failed(ctx, "pair-setup M4", &e);
    }

    // Transient mode is complete here; the 64-byte SRP key becomes the
    // transport secret
    let secret = ctx
        .pair_setup
        .as_ref()
        .and_then(PairSetup::shared_secret)
        .map(<[u8]>::to_vec);
    if let Some(secret) = secret {
        ctx.shared_secret = secret.clone();
        ctx.pending_secret = Some(secret);
        ctx.state = ProtoState::Encrypted;
    }
    SeqNext::Continue
}

fn handler_pair_setup3(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    let result = match ctx.pair_setup.as_mut() {
        Some(setup) => setup.response3(&response.body),
        None => return SeqNext::Abort,
    };
    if let Err(e) = result {
        return pair_failed(ctx, "pair-setup M6", &e);
    }

    let Some(keys) = ctx.pair_setup.as_ref().and_then(PairSetup::keys) else {
        return SeqNext::Abort;
    };
    tracing::info!("pair-setup with '{}' complete", ctx.device.name);

    // Persist the authorisation key, then prove possession via pair-verify
    ctx.device.auth_key = Some(keys.to_auth_string());
    ctx.keys_to_persist = Some(keys);
    ctx.device.flags.requires_auth = false;
    SeqNext::Start(SeqType::PairVerify)
}

fn handler_pair_verify1(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    if !response.is_success() {
        // The device no longer accepts our stored key; drop it and pair anew
        tracing::warn!(
            "pair-verify rejected by '{}', discarding stored key",
            ctx.device.name
        );
        ctx.device.auth_key = None;
        ctx.device.flags.requires_auth = true;
        ctx.state = ProtoState::Auth;
        return SeqNext::Start(SeqType::PinStart);
    }

    let result = match ctx.pair_verify.as_mut() {
        Some(verify) => verify.response1(&response.body),
        None => return SeqNext::Abort,
    };
    match result {
        Ok(()) => SeqNext::Continue,
        Err(e) => pair_failed(ctx, "pair-verify M2", &e),
    }
}

fn handler_pair_verify2(ctx: &mut SessionCtx, response: &RtspResponse) -> SeqNext {
    let result = match ctx.pair_verify.as_mut() {
        Some(verify) => verify.response2(&response.body),
        None => return SeqNext::Abort,
    };
    if let Err(e) = result {
        return pair_failed(ctx, "pair-verify M4", &e);
    }

    let secret = ctx
        .pair_verify
        .as_ref()
        .and_then(PairVerify::shared_secret)
        .map(|s| s.to_vec());
    if let Some(secret) = secret {
        ctx.shared_secret = secret.clone();
        ctx.pending_secret = Some(secret);
        ctx.state = ProtoState::Encrypted;
    }
    SeqNext::Continue
}
