//! End-to-end session scenarios against the mock speaker: transient start,
//! normal pairing with key persistence, password digest retry, retransmits
//! and teardown.

use std::time::Duration;

use tonecast::output::airplay::AirplayOutput;
use tonecast::output::{Output, OutputCallbacks, OutputStatus, StatusEvent};
use tonecast::testing::{MockSpeaker, MockSpeakerConfig};
use tonecast::types::{AudioQuality, OutputConfig, PairingMode};

struct Fixture {
    output: AirplayOutput,
    status_rx: tokio::sync::mpsc::UnboundedReceiver<StatusEvent>,
    _dir: tempfile::TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn fixture() -> Fixture {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
    let (remote_tx, _remote_rx) = tokio::sync::mpsc::unbounded_channel();

    let config = OutputConfig {
        name: "tonecast-test".to_string(),
        library_id: 0x8f28_e2a5_c1d9_f1aa,
        keystore_path: dir.path().join("pairings.json"),
        cache_dir: dir.path().to_path_buf(),
        // Unprivileged test environment; let PTP fail over to NTP
        ptp_event_port: 0,
        ptp_general_port: 0,
        ..OutputConfig::default()
    };

    let callbacks = OutputCallbacks {
        status: status_tx,
        remote: remote_tx,
    };
    let mut output = AirplayOutput::new(config, callbacks).unwrap();
    output.init().await.unwrap();

    Fixture {
        output,
        status_rx,
        _dir: dir,
    }
}

fn pcm(samples: usize) -> Vec<u8> {
    vec![0u8; AudioQuality::default().samples_to_bytes(samples)]
}

async fn drain_status(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) -> Vec<OutputStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        statuses.push(event.status);
    }
    statuses
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_start_runs_the_expected_wire_sequence() {
    let speaker = MockSpeaker::start(MockSpeakerConfig::default()).await.unwrap();
    let mut fx = fixture().await;

    let device = speaker.device(PairingMode::Transient);
    fx.output.device_start(&device).await.unwrap();

    // Feed audio; the joiner gets its init sync and marker packet, then
    // moves to streaming
    for i in 0..6 {
        fx.output
            .write(&pcm(441), AudioQuality::default(), Duration::from_millis(10 * i));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let recording = speaker.recording();

    // S1 wire order: info, transient pair-setup (two messages), then the
    // playback chain
    let heads: Vec<&str> = recording.requests.iter().map(String::as_str).collect();
    assert_eq!(heads[0], "GET /info");
    assert_eq!(heads[1], "POST /pair-setup");
    assert_eq!(heads[2], "POST /pair-setup");
    assert!(heads[3].starts_with("SETUP"));
    assert!(heads[4].starts_with("RECORD"));
    assert!(heads[5].starts_with("SETPEERS"));
    assert!(heads[6].starts_with("SETUP"));
    assert!(heads[7].starts_with("SET_PARAMETER"));

    assert!(recording.paired, "control channel switched to ciphered");

    // One join sync went out before audio
    assert!(!recording.sync_packets.is_empty());
    assert_eq!(recording.sync_packets[0].0, 0x90);

    // The first audio packet carries the marker bit, later ones do not
    assert!(!recording.audio_packets.is_empty());
    assert!(recording.audio_packets[0].1);
    if recording.audio_packets.len() > 1 {
        assert!(!recording.audio_packets[1].1);
    }

    // Volume was sent as dB in text/parameters
    assert!(!recording.volumes.is_empty());
    assert!(recording.volumes[0].parse::<f32>().is_ok());

    // Status progression reached streaming
    let statuses = drain_status(&mut fx.status_rx).await;
    assert!(statuses.contains(&OutputStatus::Startup));
    assert!(statuses.contains(&OutputStatus::Connected));
    assert!(statuses.contains(&OutputStatus::Streaming));

    fx.output.device_stop(device.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recording = speaker.recording();
    assert_eq!(recording.teardowns.len(), 1);
    assert!(recording.teardowns[0].get("streams").is_some());

    let statuses = drain_status(&mut fx.status_rx).await;
    assert!(statuses.contains(&OutputStatus::Stopped));

    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn normal_pairing_persists_keys_and_verifies_on_restart() {
    let speaker = MockSpeaker::start(MockSpeakerConfig {
        pin: "1234".to_string(),
        ..MockSpeakerConfig::default()
    })
    .await
    .unwrap();
    let mut fx = fixture().await;

    let mut device = speaker.device(PairingMode::Normal);
    device.pin = Some("1234".to_string());

    // First start: full six-message pair-setup, then verify
    fx.output.device_start(&device).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = speaker.recording();
    let setups = first.requests.iter().filter(|r| r.ends_with("/pair-setup")).count();
    let verifies = first.requests.iter().filter(|r| r.ends_with("/pair-verify")).count();
    assert_eq!(setups, 3, "normal pair-setup is three round trips");
    assert_eq!(verifies, 2, "verify follows setup");

    fx.output.device_stop(device.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second start: the stored key skips pair-setup entirely
    device.pin = None;
    fx.output.device_start(&device).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = speaker.recording();
    let setups_after = second.requests.iter().filter(|r| r.ends_with("/pair-setup")).count();
    let verifies_after = second.requests.iter().filter(|r| r.ends_with("/pair-verify")).count();
    assert_eq!(setups_after, 3, "no new pair-setup messages");
    assert_eq!(verifies_after, 4, "a fresh verify ran");

    let _ = drain_status(&mut fx.status_rx).await;
    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn password_device_gets_one_digest_retry() {
    let speaker = MockSpeaker::start(MockSpeakerConfig {
        password: Some("secret".to_string()),
        ..MockSpeakerConfig::default()
    })
    .await
    .unwrap();
    let mut fx = fixture().await;

    let mut device = speaker.device(PairingMode::Transient);
    device.password = Some("secret".to_string());

    fx.output.device_start(&device).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The session SETUP appears twice: the 401 challenge and the
    // authorised retry
    let recording = speaker.recording();
    let session_setups = recording
        .requests
        .iter()
        .filter(|r| r.starts_with("SETUP"))
        .count();
    assert_eq!(session_setups, 3, "setup(session) x2 + setup(stream)");

    let _ = drain_status(&mut fx.status_rx).await;
    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_fails_the_start() {
    let speaker = MockSpeaker::start(MockSpeakerConfig {
        password: Some("secret".to_string()),
        ..MockSpeakerConfig::default()
    })
    .await
    .unwrap();
    let mut fx = fixture().await;

    let mut device = speaker.device(PairingMode::Transient);
    device.password = Some("wrong".to_string());

    assert!(fx.output.device_start(&device).await.is_err());

    let statuses = drain_status(&mut fx.status_rx).await;
    assert!(statuses.contains(&OutputStatus::Failed));

    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn retransmit_request_is_served_from_the_ring() {
    let speaker = MockSpeaker::start(MockSpeakerConfig::default()).await.unwrap();
    let mut fx = fixture().await;

    let device = speaker.device(PairingMode::Transient);
    fx.output.device_start(&device).await.unwrap();

    // Stream a few packets
    for i in 0..4 {
        fx.output.write(
            &pcm(352),
            AudioQuality::default(),
            Duration::from_millis(8 * i),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let before = speaker.recording();
    assert!(before.audio_packets.len() >= 3);
    let first_seq = before.audio_packets[0].0;

    // S4: ask for three packets back
    speaker
        .request_retransmit(fx.output.control_port(), 1, first_seq, 3)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = speaker.recording();
    assert!(
        after.audio_packets.len() >= before.audio_packets.len() + 3,
        "three packets were resent"
    );

    // The resent payloads match the originals
    for k in 0..3u16 {
        let seq = first_seq.wrapping_add(k);
        let copies: Vec<&Vec<u8>> = after
            .audio_packets
            .iter()
            .filter(|(s, _, _)| *s == seq)
            .map(|(_, _, payload)| payload)
            .collect();
        assert!(copies.len() >= 2, "seq {seq} resent");
        assert_eq!(copies[0], copies[1]);
    }

    let _ = drain_status(&mut fx.status_rx).await;
    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn resurrect_sends_the_final_empty_teardown() {
    let speaker = MockSpeaker::start(MockSpeakerConfig::default()).await.unwrap();
    let mut fx = fixture().await;

    let mut device = speaker.device(PairingMode::Transient);
    device.flags.resurrect = true;

    fx.output.device_start(&device).await.unwrap();
    fx.output.device_stop(device.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // S5: first teardown names the stream, the final one is empty
    let recording = speaker.recording();
    assert_eq!(recording.teardowns.len(), 2);
    assert!(recording.teardowns[0].get("streams").is_some());
    assert!(recording.teardowns[1].get("streams").is_none());

    let _ = drain_status(&mut fx.status_rx).await;
    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_changes_reach_the_device() {
    let speaker = MockSpeaker::start(MockSpeakerConfig::default()).await.unwrap();
    let mut fx = fixture().await;

    let device = speaker.device(PairingMode::Transient);
    fx.output.device_start(&device).await.unwrap();

    fx.output.device_volume_set(device.id, 100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recording = speaker.recording();
    // Startup volume plus the explicit set
    assert!(recording.volumes.len() >= 2);
    let last: f32 = recording.volumes.last().unwrap().parse().unwrap();
    assert!((last - 0.0).abs() < 0.01, "volume 100 maps to 0 dB");

    let _ = drain_status(&mut fx.status_rx).await;
    fx.output.deinit().await;
    speaker.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_pairing_is_rejected_without_io() {
    let mut fx = fixture().await;
    let speaker = MockSpeaker::start(MockSpeakerConfig::default()).await.unwrap();

    let device = speaker.device(PairingMode::Unsupported);
    assert!(fx.output.device_start(&device).await.is_err());

    assert!(speaker.recording().requests.is_empty());

    fx.output.deinit().await;
    speaker.stop();
}
