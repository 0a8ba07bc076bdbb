//! IEEE 1588-2008 (PTPv2) slave manager.
//!
//! When a device advertises PTP timing (feature bit 41), the session asks
//! this manager for a slave tracking that device as grandmaster instead of
//! using the NTP-style timing service. One slave exists per peer address,
//! refcounted across sessions. The process-wide clock identifier is seeded
//! at init and embedded in every PTP SETUP plist.

mod message;


pub use message::{PtpBody, PtpHeader, PtpMessageType, PtpTimestamp};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// The privileged default ports; binding them must happen before the daemon
/// drops privileges
pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;

/// Identifies one slave instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveId(pub u64);

#[derive(Debug, Error)]
pub enum PtpError {
    #[error("could not bind PTP port: {0}")]
    Bind(std::io::Error),
}

enum Command {
    SlaveAdd(IpAddr, tokio::sync::oneshot::Sender<SlaveId>),
    SlaveRemove(SlaveId),
    Shutdown,
}

/// Cloneable handle to the manager task
#[derive(Clone)]
pub struct PtpHandle {
    cmd: mpsc::UnboundedSender<Command>,
    clock_id: u64,
}

impl PtpHandle {
    /// The process-wide clock identifier
    #[must_use]
    pub fn clock_id(&self) -> u64 {
        self.clock_id
    }

    /// Ensure a slave tracks the grandmaster at `addr`
    pub async fn slave_add(&self, addr: IpAddr) -> Option<SlaveId> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cmd.send(Command::SlaveAdd(addr, tx)).ok()?;
        rx.await.ok()
    }

    /// Drop a reference to a slave; the instance dies with its last user
    pub fn slave_remove(&self, id: SlaveId) {
        let _ = self.cmd.send(Command::SlaveRemove(id));
    }
}

struct Slave {
    id: SlaveId,
    grandmaster: IpAddr,
    refcount: usize,
    /// Clock identity of the grandmaster, learned from Announce
    gm_identity: Option<u64>,
    /// Sequence id of the Sync we are waiting to match with a Follow_Up
    pending_sync: Option<(u16, PtpTimestamp)>,
    /// Last measured offset estimate in nanoseconds
    offset_ns: i64,
}

/// The slave manager. Owns the event/general sockets and the slave map.
pub struct PtpManager {
    handle: PtpHandle,
    task: tokio::task::JoinHandle<()>,
}

impl PtpManager {
    /// Bind the PTP ports and start the manager task. Use port 0 in tests.
    pub async fn start(event_port: u16, general_port: u16) -> Result<Self, PtpError> {
        let event_socket = UdpSocket::bind(("0.0.0.0", event_port))
            .await
            .map_err(PtpError::Bind)?;
        let general_socket = UdpSocket::bind(("0.0.0.0", general_port))
            .await
            .map_err(PtpError::Bind)?;

        let clock_id: u64 = rand::thread_rng().r#gen();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tracing::info!(
            "PTP slave manager on ports {}/{}, clock id {clock_id:#018x}",
            event_socket.local_addr().map(|a| a.port()).unwrap_or(0),
            general_socket.local_addr().map(|a| a.port()).unwrap_or(0),
        );

        let task = tokio::spawn(manager_loop(event_socket, general_socket, cmd_rx));

        Ok(Self {
            handle: PtpHandle {
                cmd: cmd_tx,
                clock_id,
            },
            task,
        })
    }

    #[must_use]
    pub fn handle(&self) -> PtpHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.handle.cmd.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

async fn manager_loop(
    event_socket: UdpSocket,
    general_socket: UdpSocket,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut slaves: HashMap<IpAddr, Slave> = HashMap::new();
    let next_id = AtomicU64::new(1);

    let mut event_buf = [0u8; 256];
    let mut general_buf = [0u8; 256];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::SlaveAdd(addr, reply)) => {
                    let slave = slaves.entry(addr).or_insert_with(|| {
                        tracing::debug!("starting PTP slave for grandmaster {addr}");
                        Slave {
                            id: SlaveId(next_id.fetch_add(1, Ordering::Relaxed)),
                            grandmaster: addr,
                            refcount: 0,
                            gm_identity: None,
                            pending_sync: None,
                            offset_ns: 0,
                        }
                    });
                    slave.refcount += 1;
                    let _ = reply.send(slave.id);
                }
                Some(Command::SlaveRemove(id)) => {
                    if let Some(addr) = slaves
                        .iter_mut()
                        .find(|(_, s)| s.id == id)
                        .and_then(|(addr, s)| {
                            s.refcount -= 1;
                            (s.refcount == 0).then_some(*addr)
                        })
                    {
                        tracing::debug!("stopping PTP slave for grandmaster {addr}");
                        slaves.remove(&addr);
                    }
                }
                Some(Command::Shutdown) | None => break,
            },

            received = event_socket.recv_from(&mut event_buf) => {
                if let Ok((len, peer)) = received {
                    handle_message(&mut slaves, peer.ip(), &event_buf[..len]);
                }
            }

            received = general_socket.recv_from(&mut general_buf) => {
                if let Ok((len, peer)) = received {
                    handle_message(&mut slaves, peer.ip(), &general_buf[..len]);
                }
            }
        }
    }
}

fn handle_message(slaves: &mut HashMap<IpAddr, Slave>, peer: IpAddr, data: &[u8]) {
    let Some(slave) = slaves.get_mut(&peer) else {
        return;
    };
    let Some((header, body)) = message::parse(data) else {
        return;
    };

    match body {
        PtpBody::Announce { grandmaster_identity } => {
            if slave.gm_identity != Some(grandmaster_identity) {
                tracing::debug!(
                    "PTP grandmaster at {} has identity {grandmaster_identity:#018x}",
                    slave.grandmaster
                );
                slave.gm_identity = Some(grandmaster_identity);
            }
        }
        PtpBody::Sync { origin } => {
            // Two-step masters send the precise stamp in a Follow_Up
            if header.two_step {
                slave.pending_sync = Some((header.sequence_id, now_ts()));
            } else {
                slave.offset_ns = offset_from(origin, now_ts());
            }
        }
        PtpBody::FollowUp { origin } => {
            if let Some((seq, recv_ts)) = slave.pending_sync.take() {
                if seq == header.sequence_id {
                    slave.offset_ns = offset_from(origin, recv_ts);
                    tracing::trace!(
                        "PTP offset to {}: {} ns",
                        slave.grandmaster,
                        slave.offset_ns
                    );
                } else {
                    slave.pending_sync = Some((seq, recv_ts));
                }
            }
        }
        PtpBody::Other => {}
    }
}

fn now_ts() -> PtpTimestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    PtpTimestamp {
        seconds: now.as_secs(),
        nanos: now.subsec_nanos(),
    }
}

#[allow(clippy::cast_possible_wrap)]
fn offset_from(origin: PtpTimestamp, receipt: PtpTimestamp) -> i64 {
    let origin_ns = origin.seconds as i64 * 1_000_000_000 + i64::from(origin.nanos);
    let receipt_ns = receipt.seconds as i64 * 1_000_000_000 + i64::from(receipt.nanos);
    receipt_ns - origin_ns
}
