//! The reverse event channel. After SETUP (session) we open a TCP
//! connection to the event port the device returned; the device then sends
//! RTSP-shaped requests over it (transport commands from its own buttons),
//! ciphered with the Events-Salt key pair. Each request gets a 200 OK.

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::output::RemoteCommand;
use crate::pairing::{Channel, CipherContext, Role};
use crate::plist::PlistValue;
use crate::rtsp::{Headers, ParsedRequest, RequestCodec, StatusCode, server::encode_response};

/// Spawn the event-channel task for one device session
pub fn start(
    peer: IpAddr,
    port: u16,
    shared_secret: Vec<u8>,
    device_id: u64,
    remote: mpsc::UnboundedSender<(u64, RemoteCommand)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen(peer, port, &shared_secret, device_id, remote).await {
            tracing::debug!("event channel for {device_id:#x} closed: {e}");
        }
    })
}

async fn listen(
    peer: IpAddr,
    port: u16,
    shared_secret: &[u8],
    device_id: u64,
    remote: mpsc::UnboundedSender<(u64, RemoteCommand)>,
) -> Result<(), crate::error::OutputError> {
    let mut stream = TcpStream::connect((peer, port)).await?;
    // We opened the connection but serve requests on it, so the accessory
    // key layout applies
    let mut cipher = CipherContext::new(shared_secret, Channel::Events, Role::Accessory)?;

    let mut codec = RequestCodec::new();
    let mut residue: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    tracing::debug!("event channel to {peer}:{port} up");

    loop {
        while let Some(request) = codec.decode()? {
            let reply = handle_request(&request, device_id, &remote);
            let wire = cipher.encrypt(&reply)?;
            stream.write_all(&wire).await?;
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        residue.extend_from_slice(&buf[..n]);
        let (plain, consumed) = cipher.decrypt(&residue)?;
        residue.drain(..consumed);
        codec.feed(&plain)?;
    }
}

fn handle_request(
    request: &ParsedRequest,
    device_id: u64,
    remote: &mpsc::UnboundedSender<(u64, RemoteCommand)>,
) -> Vec<u8> {
    if let Some(command) = parse_command(request) {
        tracing::debug!("event channel command from {device_id:#x}: {command:?}");
        let _ = remote.send((device_id, command));
    } else {
        tracing::debug!(
            "unhandled event channel request {} {}",
            request.method,
            request.uri
        );
    }

    let mut headers = Headers::new();
    if let Some(cseq) = request.headers.cseq() {
        headers.insert(crate::rtsp::headers::names::CSEQ, cseq.to_string());
    }
    encode_response(StatusCode::OK, "OK", &headers, &[])
}

/// Commands arrive as a binary plist with a `type` string
fn parse_command(request: &ParsedRequest) -> Option<RemoteCommand> {
    if request.method != "POST" || request.uri != "/command" {
        return None;
    }

    let plist = crate::plist::decode(&request.body).ok()?;
    match plist.get("type").and_then(PlistValue::as_str)? {
        "play" => Some(RemoteCommand::Play),
        "pause" => Some(RemoteCommand::Pause),
        "next" => Some(RemoteCommand::Next),
        "prev" | "previous" => Some(RemoteCommand::Previous),
        _ => None,
    }
}
