//! The RTSP half of a device session: one TCP connection, optionally
//! ciphered after pairing, driven through the declarative request sequences.
//! Each session runs as its own task; the streaming half lives in the
//! engine and is registered here once SETUP completes.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};

use crate::error::OutputError;
use crate::output::{Metadata, OutputCallbacks, StatusEvent};
use crate::pairing::storage::KeyStore;
use crate::pairing::{Channel, CipherContext, Role};
use crate::rtsp::{RtspCodec, RtspRequest, RtspResponse, headers::names};
use crate::types::{OutputConfig, OutputDevice};

use super::engine::{EngineState, StreamEntry, StreamState};
use super::events;
use super::sequence::{
    BuildResult, ProtoState, SeqNext, SeqType, SessionCtx, follow_up, steps,
};

/// Username presented in digest auth; password-protected speakers only
/// check the password, so the username is empty
const AUTH_USERNAME: &str = "";

/// Commands to a running session actor
#[derive(Debug)]
pub enum SessionCommand {
    Volume(i32),
    Flush,
    /// Graceful teardown
    Stop,
    /// Deferred failure from the send path
    Fail,
    /// Updated metadata; `true` restricts the send to progress
    Metadata(Box<Metadata>, bool),
    /// Keep-alive feedback tick
    Feedback,
}

/// The actor's half of the channel pair, owned by the backend
pub struct SessionHandle {
    pub cmd: mpsc::UnboundedSender<SessionCommand>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Everything a session task needs from the backend
pub struct SessionArgs {
    pub device: OutputDevice,
    pub config: OutputConfig,
    pub use_ptp: bool,
    pub clock_id: u64,
    pub timing_port: u16,
    pub control_svc_port: u16,
    pub engine: Arc<StdMutex<EngineState>>,
    pub callbacks: OutputCallbacks,
    pub keystore: Arc<StdMutex<KeyStore>>,
    pub ipv6_blocklist: Arc<StdMutex<HashSet<u64>>>,
    pub ptp: Option<crate::ptp::PtpHandle>,
}

/* ----------------------------- Connection -------------------------------- */

/// One RTSP control connection. Once `install_cipher` ran, every byte in
/// both directions passes through the pairing cipher.
pub struct RtspConnection {
    stream: TcpStream,
    codec: RtspCodec,
    cipher: Option<CipherContext>,
    /// Ciphertext bytes of an incomplete trailing block
    residue: Vec<u8>,
    cseq: u32,
}

impl RtspConnection {
    /// Connect to the device, falling back from ipv6 to ipv4 once. The bool
    /// reports whether the fallback happened (the flag is then persisted).
    pub async fn connect(device: &OutputDevice) -> Result<(Self, bool), OutputError> {
        let Some(addr) = device.preferred_address() else {
            return Err(OutputError::Capability("no usable address"));
        };

        match TcpStream::connect((addr, device.port)).await {
            Ok(stream) => Ok((Self::from_stream(stream), false)),
            Err(e) if addr.is_ipv6() => {
                let v4 = device.addresses.iter().find(|a| a.is_ipv4()).copied();
                let Some(v4) = v4 else {
                    return Err(OutputError::Transport(e));
                };
                tracing::warn!(
                    "ipv6 connect to '{}' failed ({e}), retrying over ipv4",
                    device.name
                );
                let stream = TcpStream::connect((v4, device.port)).await?;
                Ok((Self::from_stream(stream), true))
            }
            Err(e) => Err(OutputError::Transport(e)),
        }
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: RtspCodec::new(),
            cipher: None,
            residue: Vec::new(),
            cseq: 0,
        }
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.stream.local_addr().ok().map(|a| a.ip())
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.stream.peer_addr().ok().map(|a| a.ip())
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    pub fn install_cipher(&mut self, cipher: CipherContext) {
        self.cipher = Some(cipher);
    }

    /// Send one request and wait for its response. RTSP requests have no
    /// hard timeout; transport errors fail the session.
    pub async fn exchange(&mut self, request: RtspRequest) -> Result<RtspResponse, OutputError> {
        let plain = request.encode();

        let wire = match &mut self.cipher {
            Some(cipher) => cipher.encrypt(&plain).map_err(OutputError::from)?,
            None => plain,
        };

        if let Err(e) = self.stream.write_all(&wire).await {
            // Keep the block counter aligned with what the peer has seen
            if let Some(cipher) = &mut self.cipher {
                cipher.encrypt_rollback();
            }
            return Err(OutputError::Transport(e));
        }

        loop {
            if let Some(response) = self.codec.decode()? {
                return Ok(response);
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(OutputError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }

            match &mut self.cipher {
                Some(cipher) => {
                    self.residue.extend_from_slice(&buf[..n]);
                    let (plain, consumed) = cipher.decrypt(&self.residue)?;
                    self.residue.drain(..consumed);
                    self.codec.feed(&plain)?;
                }
                None => self.codec.feed(&buf[..n])?,
            }
        }
    }
}

/* ------------------------------- Driver ---------------------------------- */

/// Run one sequence to completion. `Ok(Some(seq))` means a response handler
/// jumped to another sequence.
pub async fn drive_sequence(
    seq: SeqType,
    ctx: &mut SessionCtx,
    conn: &mut RtspConnection,
) -> Result<Option<SeqType>, OutputError> {
    for step in steps(seq) {
        let (body, extra_headers) = match step.payload {
            None => (Vec::new(), Vec::new()),
            Some(build) => match build(ctx) {
                BuildResult::Send { body, headers } => (body, headers),
                BuildResult::Skip => continue,
                BuildResult::Abort => {
                    return Err(OutputError::Protocol(format!(
                        "{} payload builder aborted",
                        step.name
                    )));
                }
            },
        };

        let uri = step
            .uri
            .map_or_else(|| ctx.session_url.clone(), str::to_string);

        let cseq = conn.next_cseq();
        let mut builder = RtspRequest::builder(step.method, uri.clone())
            .cseq(cseq)
            .user_agent(&format!("{}/{}", ctx.config.name, env!("CARGO_PKG_VERSION")))
            .header(names::CLIENT_INSTANCE, ctx.client_id.clone())
            .header(names::DACP_ID, ctx.client_id.clone())
            .header(names::ACTIVE_REMOTE, ctx.device.active_remote().to_string());

        if let Some(content_type) = step.content_type {
            builder = builder.content_type(content_type);
        }
        for (name, value) in extra_headers {
            builder = builder.header(name, value);
        }

        // Digest auth from an earlier 401, covering the re-armed sequence
        if let (Some(digest), Some(password)) = (&ctx.digest, &ctx.device.password) {
            builder = builder.header(
                names::AUTHORIZATION,
                digest.authorization(AUTH_USERNAME, password, step.method, &uri),
            );
            ctx.req_has_auth = true;
        }

        let request = builder.body(body).build();
        tracing::debug!("sending {} to '{}'", step.name, ctx.device.name);

        let response = conn.exchange(request).await?;

        if !response.is_success() && !step.proceed_on_non_ok {
            tracing::error!(
                "response to {} from '{}' was negative, aborting ({} {})",
                step.name,
                ctx.device.name,
                response.status.as_u16(),
                response.reason
            );
            return Err(OutputError::Protocol(format!("{} rejected", step.name)));
        }
        if !response.is_success() && step.proceed_on_non_ok && step.handler.is_none() {
            tracing::warn!(
                "response to {} from '{}' was negative, proceeding anyway ({})",
                step.name,
                ctx.device.name,
                response.status.as_u16()
            );
        }

        let next = match step.handler {
            Some(handler) => handler(ctx, &response),
            None => SeqNext::Continue,
        };

        // A pairing handler may have produced the transport secret; all
        // traffic from the next request on is ciphered
        if let Some(secret) = ctx.pending_secret.take() {
            conn.install_cipher(CipherContext::new(&secret, Channel::Control, Role::Controller)?);
            tracing::debug!("control channel to '{}' is now encrypted", ctx.device.name);
        }

        match next {
            SeqNext::Continue => {}
            SeqNext::Abort => {
                return Err(OutputError::Protocol(format!("{} failed", step.name)));
            }
            SeqNext::Start(next_seq) => return Ok(Some(next_seq)),
        }
    }

    Ok(None)
}

/// Run a chain of sequences (handlers may jump) until it settles
async fn drive_chain(
    first: SeqType,
    ctx: &mut SessionCtx,
    conn: &mut RtspConnection,
) -> Result<(), OutputError> {
    let mut seq = Some(first);
    while let Some(current) = seq {
        let jump = drive_sequence(current, ctx, conn).await?;
        seq = jump.or_else(|| follow_up(current));
    }
    Ok(())
}

/* -------------------------------- Actor ---------------------------------- */

fn report(callbacks: &OutputCallbacks, device_id: u64, status: crate::output::OutputStatus) {
    let _ = callbacks.status.send(StatusEvent { device_id, status });
}

/// Probe a device: `/info` only, no pairing, no playback
pub async fn probe_device(
    device: &OutputDevice,
    config: &OutputConfig,
    clock_id: u64,
) -> Result<(), OutputError> {
    let (mut conn, _) = RtspConnection::connect(device).await?;
    let mut ctx = SessionCtx::new(device.clone(), config.clone(), false, clock_id);
    if let Some(local) = conn.local_ip() {
        ctx.session_ids_set(local);
    }

    drive_sequence(SeqType::Probe, &mut ctx, &mut conn).await?;
    Ok(())
}

/// The session actor. Drives startup, then serves commands until stop or
/// failure. `ready` resolves when the session reaches connected (or fails).
#[allow(clippy::too_many_lines)]
pub async fn session_task(
    args: SessionArgs,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ready: oneshot::Sender<Result<(), OutputError>>,
) {
    let device_id = args.device.id;
    let callbacks = args.callbacks.clone();

    report(&callbacks, device_id, crate::output::OutputStatus::Startup);

    let mut established = match session_establish(&args).await {
        Ok(established) => established,
        Err((e, requires_pin)) => {
            let status = if requires_pin {
                crate::output::OutputStatus::RequiresPassword
            } else {
                crate::output::OutputStatus::Failed
            };
            report(&callbacks, device_id, status);
            let _ = ready.send(Err(e));
            return;
        }
    };

    report(&callbacks, device_id, crate::output::OutputStatus::Connected);
    let _ = ready.send(Ok(()));

    let failed = serve_commands(&args, &mut established, &mut cmd_rx).await;

    // Cleanup: streaming entry, events listener, PTP slave
    args.engine.lock().unwrap_or_else(|e| e.into_inner()).stream_remove(device_id);
    if let Some(events) = established.events.take() {
        events.abort();
    }
    if let (Some(ptp), Some(slave)) = (&args.ptp, established.slave_id) {
        ptp.slave_remove(slave);
    }

    let status = if failed {
        crate::output::OutputStatus::Failed
    } else {
        crate::output::OutputStatus::Stopped
    };
    report(&callbacks, device_id, status);
}

struct Established {
    ctx: SessionCtx,
    conn: RtspConnection,
    events: Option<tokio::task::JoinHandle<()>>,
    slave_id: Option<crate::ptp::SlaveId>,
}

/// Connect, pair and run the playback setup chain, then register with the
/// engine. The error flags whether we are merely waiting for a PIN.
async fn session_establish(args: &SessionArgs) -> Result<Established, (OutputError, bool)> {
    let (mut conn, ipv6_failed) = RtspConnection::connect(&args.device)
        .await
        .map_err(|e| (e, false))?;

    if ipv6_failed {
        args.ipv6_blocklist
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(args.device.id);
    }

    let mut ctx = SessionCtx::new(
        args.device.clone(),
        args.config.clone(),
        args.use_ptp,
        args.clock_id,
    );
    ctx.timing_port = args.timing_port;
    ctx.control_svc_port = args.control_svc_port;
    ctx.pin = args.device.pin.clone();
    if ipv6_failed {
        ctx.device.flags.ipv6_disabled = true;
        ctx.ipv6_failed = true;
    }
    if let Some(local) = conn.local_ip() {
        ctx.session_ids_set(local);
    }

    // PTP slave first so the SETUP plist can carry the clock id
    let slave_id = match (&args.ptp, conn.peer_ip()) {
        (Some(ptp), Some(peer)) if args.use_ptp => ptp.slave_add(peer).await,
        _ => None,
    };

    drive_chain(SeqType::Start, &mut ctx, &mut conn)
        .await
        .map_err(|e| (e, ctx.state == ProtoState::Auth))?;

    if ctx.state == ProtoState::Auth {
        // PIN start ran; the user has to supply a PIN before the next attempt
        return Err((
            OutputError::Authentication("device is waiting for a PIN".into()),
            true,
        ));
    }

    // Persist keys from a completed normal pair-setup
    if let Some(keys) = ctx.keys_to_persist.take() {
        let result = args
            .keystore
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .save(&format!("{:016x}", args.device.id), &keys);
        if let Err(e) = result {
            tracing::error!("could not persist pairing keys for '{}': {e}", ctx.device.name);
        }
    }

    // Streaming sockets, bound to match the peer family
    let peer = conn
        .peer_ip()
        .ok_or((OutputError::Capability("peer address unknown"), false))?;
    let data_socket = udp_connect(peer, ctx.data_port).await.map_err(|e| (e, false))?;
    let control_socket = udp_connect(peer, ctx.control_port)
        .await
        .map_err(|e| (e, false))?;

    // Reverse event channel, ciphered with the event keys
    let events = if ctx.events_port != 0 && !ctx.shared_secret.is_empty() {
        Some(events::start(
            peer,
            ctx.events_port,
            ctx.shared_secret.clone(),
            args.device.id,
            args.callbacks.remote.clone(),
        ))
    } else {
        None
    };

    let mut audio_key = [0u8; 32];
    let n = ctx.shared_secret.len().min(32);
    audio_key[..n].copy_from_slice(&ctx.shared_secret[..n]);

    let entry = StreamEntry::new(
        args.device.id,
        ctx.device.name.clone(),
        (ctx.device.quality, args.use_ptp),
        peer,
        Arc::new(data_socket),
        Arc::new(control_socket),
        &audio_key,
        ctx.device.needs_keep_alive(),
    )
    .map_err(|e| (OutputError::Authentication(e.to_string()), false))?;

    {
        let mut engine = args.engine.lock().unwrap_or_else(|e| e.into_inner());
        engine
            .master_get_or_make(ctx.device.quality, args.use_ptp)
            .map_err(|e| (OutputError::Resource(e.to_string()), false))?;
        engine.stream_add(entry);
    }

    ctx.state = ProtoState::Connected;
    Ok(Established {
        ctx,
        conn,
        events,
        slave_id,
    })
}

async fn udp_connect(peer: IpAddr, port: u16) -> Result<UdpSocket, OutputError> {
    let bind_addr: SocketAddr = if peer.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect((peer, port)).await?;
    Ok(socket)
}

/// Serve commands until stop or failure. Returns true when the session
/// ended in failure.
async fn serve_commands(
    args: &SessionArgs,
    established: &mut Established,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> bool {
    let ctx = &mut established.ctx;
    let conn = &mut established.conn;

    while let Some(cmd) = cmd_rx.recv().await {
        let result = match cmd {
            SessionCommand::Volume(volume) => {
                ctx.volume = volume;
                drive_sequence(SeqType::SendVolume, ctx, conn).await.map(|_| ())
            }
            SessionCommand::Flush => {
                // Snapshot the restart point, stop the fan-out, then FLUSH
                {
                    let mut engine = args.engine.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(ams) = engine.masters.get(&(ctx.device.quality, args.use_ptp)) {
                        ctx.flush_seqnum = ams.rtp.seqnum;
                        ctx.flush_rtptime = ams.rtp.pos;
                    }
                    if let Some(stream) = engine
                        .streams
                        .iter_mut()
                        .find(|s| s.device_id == ctx.device.id)
                    {
                        stream.state = StreamState::Connected;
                    }
                }
                drive_sequence(SeqType::Flush, ctx, conn).await.map(|_| ())
            }
            SessionCommand::Stop => {
                args.engine
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .stream_remove(ctx.device.id);

                let result = drive_sequence(SeqType::Stop, ctx, conn).await;
                if result.is_ok() && ctx.device.flags.resurrect {
                    // Final teardown with an empty plist releases the device
                    // completely so it can be resurrected cleanly
                    let _ = drive_sequence(SeqType::Failure, ctx, conn).await;
                    ctx.state = ProtoState::Stopped;
                }
                return result.is_err();
            }
            SessionCommand::Fail => {
                args.engine
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .stream_remove(ctx.device.id);
                let _ = drive_sequence(SeqType::Failure, ctx, conn).await;
                return true;
            }
            SessionCommand::Metadata(metadata, only_progress) => {
                ctx.metadata = *metadata;
                metadata_send(ctx, conn, only_progress).await
            }
            SessionCommand::Feedback => {
                drive_sequence(SeqType::Feedback, ctx, conn).await.map(|_| ())
            }
        };

        if let Err(e) = result {
            tracing::error!("session with '{}' failed: {e}", ctx.device.name);
            return true;
        }
    }

    // Backend dropped the handle; treat as stop without teardown
    false
}

async fn metadata_send(
    ctx: &mut SessionCtx,
    conn: &mut RtspConnection,
    only_progress: bool,
) -> Result<(), OutputError> {
    if ctx.device.wants_progress {
        drive_sequence(SeqType::SendProgress, ctx, conn).await?;
    }
    if only_progress {
        return Ok(());
    }
    if ctx.device.wants_text {
        drive_sequence(SeqType::SendText, ctx, conn).await?;
    }
    if ctx.device.wants_artwork {
        drive_sequence(SeqType::SendArtwork, ctx, conn).await?;
    }
    Ok(())
}
