//! The AirPlay 2 output backend: shared timing/control services, the PTP
//! slave manager, the streaming engine, and one session actor per speaker.

pub mod engine;
pub mod events;
pub mod master;
pub mod sequence;
pub mod service;
pub mod session;


use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::OutputError;
use crate::output::{Metadata, Output, OutputCallbacks, OutputStatus, StatusEvent};
use crate::pairing::storage::KeyStore;
use crate::ptp::PtpManager;
use crate::types::{AudioQuality, OutputConfig, OutputDevice, PairingMode};

use engine::EngineState;
use service::Service;
use session::{SessionArgs, SessionCommand, SessionHandle};

/// The AirPlay 2 output backend
pub struct AirplayOutput {
    config: OutputConfig,
    callbacks: OutputCallbacks,
    engine: Arc<StdMutex<EngineState>>,
    keystore: Arc<StdMutex<KeyStore>>,
    /// Devices whose ipv6 route failed once; sticks for the process lifetime
    /// and is persisted onto the device flags
    ipv6_blocklist: Arc<StdMutex<HashSet<u64>>>,
    sessions: Arc<StdMutex<HashMap<u64, SessionHandle>>>,
    timing: Option<Service>,
    control: Option<Service>,
    ptp: Option<PtpManager>,
    keep_alive: Arc<StdMutex<Option<tokio::task::JoinHandle<()>>>>,
    metadata: Metadata,
    clock_id: u64,
    initialized: bool,
}

impl AirplayOutput {
    pub fn new(config: OutputConfig, callbacks: OutputCallbacks) -> Result<Self, OutputError> {
        let keystore = KeyStore::open(&config.keystore_path)
            .map_err(|e| OutputError::Resource(format!("keystore: {e}")))?;

        Ok(Self {
            engine: Arc::new(StdMutex::new(EngineState::new(config.buffer_duration, 0))),
            config,
            callbacks,
            keystore: Arc::new(StdMutex::new(keystore)),
            ipv6_blocklist: Arc::new(StdMutex::new(HashSet::new())),
            sessions: Arc::new(StdMutex::new(HashMap::new())),
            timing: None,
            control: None,
            ptp: None,
            keep_alive: Arc::new(StdMutex::new(None)),
            metadata: Metadata::default(),
            clock_id: 0,
            initialized: false,
        })
    }

    /// Port of the timing service, once initialised
    #[must_use]
    pub fn timing_port(&self) -> u16 {
        self.timing.as_ref().map_or(0, |s| s.port)
    }

    /// Port of the control service, once initialised
    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.control.as_ref().map_or(0, |s| s.port)
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fill in state this backend keeps across starts: stored pairing keys
    /// and the ipv6 preference
    fn enrich_device(&self, device: &OutputDevice) -> OutputDevice {
        let mut device = device.clone();

        if device.auth_key.is_none() {
            let keystore = self.keystore.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(keys) = keystore.load(&format!("{:016x}", device.id)) {
                device.auth_key = Some(keys.to_auth_string());
            }
        }

        let blocklist = self.ipv6_blocklist.lock().unwrap_or_else(|e| e.into_inner());
        if blocklist.contains(&device.id) {
            device.flags.ipv6_disabled = true;
        }

        device
    }

    /// Feedback timer for devices that drop idle connections. Armed when the
    /// first such device starts streaming, stops itself once none is left.
    fn keep_alive_arm(&self) {
        let mut slot = self.keep_alive.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        let keep_alive = self.keep_alive.clone();
        let interval = self.config.keep_alive_interval;

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let wants = engine
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .wants_keep_alive();
                if !wants {
                    break;
                }

                for handle in sessions.lock().unwrap_or_else(|e| e.into_inner()).values() {
                    let _ = handle.cmd.send(SessionCommand::Feedback);
                }
            }
            keep_alive
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }));
    }

    fn session_command(&self, device_id: u64, command: SessionCommand) -> Result<(), OutputError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let handle = sessions
            .get(&device_id)
            .ok_or(OutputError::Capability("no session for device"))?;
        handle
            .cmd
            .send(command)
            .map_err(|_| OutputError::Capability("session is gone"))
    }
}

#[async_trait]
impl Output for AirplayOutput {
    async fn init(&mut self) -> Result<(), OutputError> {
        if self.initialized {
            return Ok(());
        }

        self.timing = Some(service::timing_start(self.config.timing_port).await?);
        self.control = Some(service::control_start(self.config.control_port, self.engine.clone()).await?);

        // The PTP ports are privileged; when they cannot be bound we fall
        // back to NTP timing for every device
        match PtpManager::start(self.config.ptp_event_port, self.config.ptp_general_port).await {
            Ok(ptp) => {
                self.clock_id = ptp.handle().clock_id();
                self.ptp = Some(ptp);
            }
            Err(e) => {
                tracing::warn!("PTP unavailable, staying on NTP timing: {e}");
                self.clock_id = rand::random();
            }
        }

        self.lock_engine().clock_id = self.clock_id;
        self.initialized = true;
        Ok(())
    }

    async fn deinit(&mut self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.cmd.send(SessionCommand::Stop);
            let _ = handle.task.await;
        }

        if let Some(task) = self
            .keep_alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Some(service) = self.timing.take() {
            service.stop();
        }
        if let Some(service) = self.control.take() {
            service.stop();
        }
        if let Some(ptp) = self.ptp.take() {
            ptp.shutdown().await;
        }
        self.initialized = false;
    }

    async fn device_start(&mut self, device: &OutputDevice) -> Result<(), OutputError> {
        if device.pairing_mode == PairingMode::Unsupported {
            return Err(OutputError::Capability("no supported pairing advertised"));
        }

        let device = self.enrich_device(device);
        let use_ptp = device.supports_ptp && self.ptp.is_some();

        {
            // Drop handles of sessions that already ended
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.retain(|_, h| !h.task.is_finished());
            if sessions.contains_key(&device.id) {
                return Err(OutputError::Capability("device already started"));
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let args = SessionArgs {
            device: device.clone(),
            config: self.config.clone(),
            use_ptp,
            clock_id: self.clock_id,
            timing_port: self.timing_port(),
            control_svc_port: self.control_port(),
            engine: self.engine.clone(),
            callbacks: self.callbacks.clone(),
            keystore: self.keystore.clone(),
            ipv6_blocklist: self.ipv6_blocklist.clone(),
            ptp: self.ptp.as_ref().map(PtpManager::handle),
        };

        let task = tokio::spawn(session::session_task(args, cmd_rx, ready_tx));

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.id, SessionHandle { cmd: cmd_tx, task });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&device.id);
                Err(e)
            }
            Err(_) => {
                self.sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&device.id);
                Err(OutputError::Protocol("session task died".into()))
            }
        }
    }

    async fn device_probe(&mut self, device: &OutputDevice) -> Result<(), OutputError> {
        session::probe_device(device, &self.config, self.clock_id).await
    }

    async fn device_stop(&mut self, device_id: u64) -> Result<(), OutputError> {
        let handle = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&device_id)
            .ok_or(OutputError::Capability("no session for device"))?;

        let _ = handle.cmd.send(SessionCommand::Stop);
        let _ = handle.task.await;
        Ok(())
    }

    async fn device_flush(&mut self, device_id: u64) -> Result<(), OutputError> {
        self.session_command(device_id, SessionCommand::Flush)
    }

    async fn device_volume_set(&mut self, device_id: u64, volume: i32) -> Result<(), OutputError> {
        self.session_command(device_id, SessionCommand::Volume(volume))
    }

    fn write(&mut self, pcm: &[u8], quality: AudioQuality, pts: Duration) {
        let (joined, failed) = {
            let mut engine = self.lock_engine();
            let joined = engine.write(pcm, quality, pts);
            let failed = engine.failed_streams();
            for id in &failed {
                engine.stream_remove(*id);
            }
            (joined, failed)
        };

        // Failure is deferred to the session actors so nothing is torn down
        // from inside the write path
        for id in failed {
            let _ = self.session_command(id, SessionCommand::Fail);
        }

        if !joined.is_empty() {
            for id in &joined {
                let _ = self.callbacks.status.send(StatusEvent {
                    device_id: *id,
                    status: OutputStatus::Streaming,
                });
            }
            if self.lock_engine().wants_keep_alive() {
                self.keep_alive_arm();
            }
        }
    }

    async fn metadata_prepare(&mut self, metadata: Metadata) -> Result<(), OutputError> {
        self.metadata = metadata;
        Ok(())
    }

    async fn metadata_send(&mut self, device_id: Option<u64>) -> Result<(), OutputError> {
        let metadata = Box::new(self.metadata.clone());
        match device_id {
            Some(id) => self.session_command(id, SessionCommand::Metadata(metadata, false)),
            None => {
                let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
                for handle in sessions.values() {
                    let _ = handle
                        .cmd
                        .send(SessionCommand::Metadata(metadata.clone(), false));
                }
                Ok(())
            }
        }
    }
}
