//! The `Output` trait must stay object-safe and implementable out of tree;
//! the player holds backends as trait objects and tests use loopbacks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tonecast::error::OutputError;
use tonecast::output::{Metadata, Output};
use tonecast::types::{AudioQuality, OutputDevice};

#[derive(Default)]
struct LoopbackState {
    started: Vec<u64>,
    volumes: Vec<(u64, i32)>,
    written_samples: usize,
}

/// Minimal backend that just records what the player asked for
struct LoopbackOutput {
    state: Arc<Mutex<LoopbackState>>,
}

#[async_trait]
impl Output for LoopbackOutput {
    async fn init(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    async fn deinit(&mut self) {}

    async fn device_start(&mut self, device: &OutputDevice) -> Result<(), OutputError> {
        self.state.lock().unwrap().started.push(device.id);
        Ok(())
    }

    async fn device_probe(&mut self, _device: &OutputDevice) -> Result<(), OutputError> {
        Ok(())
    }

    async fn device_stop(&mut self, device_id: u64) -> Result<(), OutputError> {
        self.state.lock().unwrap().started.retain(|id| *id != device_id);
        Ok(())
    }

    async fn device_flush(&mut self, _device_id: u64) -> Result<(), OutputError> {
        Ok(())
    }

    async fn device_volume_set(&mut self, device_id: u64, volume: i32) -> Result<(), OutputError> {
        self.state.lock().unwrap().volumes.push((device_id, volume));
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], quality: AudioQuality, _pts: Duration) {
        self.state.lock().unwrap().written_samples += quality.bytes_to_samples(pcm.len());
    }

    async fn metadata_prepare(&mut self, _metadata: Metadata) -> Result<(), OutputError> {
        Ok(())
    }

    async fn metadata_send(&mut self, _device_id: Option<u64>) -> Result<(), OutputError> {
        Ok(())
    }
}

fn test_device(id: u64) -> OutputDevice {
    OutputDevice {
        id,
        name: "loopback".into(),
        model: "Loopback1,1".into(),
        addresses: vec![],
        port: 0,
        auth_key: None,
        volume: 50,
        quality: AudioQuality::default(),
        flags: tonecast::types::DeviceFlags::default(),
        pairing_mode: tonecast::types::PairingMode::Transient,
        supports_ptp: false,
        wants_progress: false,
        wants_text: false,
        wants_artwork: false,
        raw_features: 0,
        password: None,
        pin: None,
    }
}

#[tokio::test]
async fn player_drives_a_boxed_backend() {
    let state = Arc::new(Mutex::new(LoopbackState::default()));
    let mut output: Box<dyn Output> = Box::new(LoopbackOutput { state: state.clone() });

    output.init().await.unwrap();
    output.device_start(&test_device(1)).await.unwrap();
    output.device_start(&test_device(2)).await.unwrap();
    output.device_volume_set(2, 80).await.unwrap();

    let quality = AudioQuality::default();
    for i in 0..10 {
        output.write(&vec![0u8; quality.samples_to_bytes(441)], quality, Duration::from_millis(i * 10));
    }

    output.device_stop(1).await.unwrap();
    output.deinit().await;

    let state = state.lock().unwrap();
    assert_eq!(state.started, vec![2]);
    assert_eq!(state.volumes, vec![(2, 80)]);
    assert_eq!(state.written_samples, 4410);
}
