//! The two shared UDP services: the NTP-format timing reflector and the
//! control channel that receives retransmit requests. One socket each,
//! shared by every device session.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::UdpSocket;

use crate::error::OutputError;
use crate::rtp::{NtpTime, RetransmitRequest, is_timing_request, timing_reply};

use super::engine::EngineState;

/// A started service: its bound port and the task serving it
pub struct Service {
    pub port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl Service {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Start the timing reflector. Answers 32-byte `0x80 0xd2` queries with the
/// client stamp echoed and our receive/transmit stamps filled in.
pub async fn timing_start(port: u16) -> Result<Service, OutputError> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| OutputError::Resource(format!("timing service bind: {e}")))?;
    let port = socket
        .local_addr()
        .map_err(OutputError::Transport)?
        .port();

    tracing::info!("timing service on port {port}");

    let task = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                tracing::error!("error reading timing request");
                continue;
            };

            let recv_stamp = NtpTime::now();

            if !is_timing_request(&buf[..len]) {
                tracing::warn!("bad timing request from {peer} ({len} bytes)");
                continue;
            }

            let mut request = [0u8; 32];
            request.copy_from_slice(&buf[..32]);

            let reply = timing_reply(&request, recv_stamp, NtpTime::now());
            if let Err(e) = socket.send_to(&reply, peer).await {
                tracing::warn!("could not send timing reply to {peer}: {e}");
            }
        }
    });

    Ok(Service { port, task })
}

/// Start the control service. Parses 8-byte retransmit requests and serves
/// them from the ring of the session matching the sender address.
pub async fn control_start(
    port: u16,
    engine: Arc<StdMutex<EngineState>>,
) -> Result<Service, OutputError> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| OutputError::Resource(format!("control service bind: {e}")))?;
    let port = socket
        .local_addr()
        .map_err(OutputError::Transport)?
        .port();

    tracing::info!("control service on port {port}");

    let task = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                tracing::error!("error reading control request");
                continue;
            };

            let Some(request) = RetransmitRequest::parse(&buf[..len]) else {
                tracing::warn!("unknown control request from {peer} ({len} bytes)");
                continue;
            };

            tracing::debug!(
                "retransmit request from {peer}: seq_start={} len={}",
                request.seq_start,
                request.seq_len
            );

            engine
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retransmit(unmap_v4(peer.ip()), request);
        }
    });

    Ok(Service { port, task })
}

/// Unwrap ipv4-mapped ipv6 addresses so peer matching works across families
#[must_use]
pub fn unmap_v4(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}
