//! Audio integrity and cross-epoch media decryption.
//!
//! Audio plaintext is simulated PCM: 20 ms sine frames at 48 kHz encoded
//! as little-endian `f32`. The engine stays codec-blind; these tests
//! exercise the exporter-derived key schedule end to end over the
//! simulated transport.

use std::time::Duration;

use marmot_core::bridge::MoqService as _;
use marmot_core::media::{AadBuilder, MediaCrypto, MediaKeyring, SenderCounter, AAD_VERSION};
use marmot_harness::scenario::{pubkey_of, Scenario, CREATOR_SECRET, INVITEE_SECRET};
use marmot_harness::Participant;
use marmot_proto::MediaFrame;

const TRACK_LABEL: &str = "mic-0";
const SAMPLES_PER_FRAME: usize = 960; // 20 ms @ 48 kHz
const FRAMES: usize = 150; // 3 s @ 50 fps

fn bootstrapped(scenario: &Scenario) -> (Participant, Participant) {
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);
    let creator = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub]);
    let invitee =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub]);
    scenario.bootstrap(&creator, &invitee);
    assert!(creator.is_ready() && invitee.is_ready(), "bootstrap failed");
    (creator, invitee)
}

fn sine_frame(frame_idx: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SAMPLES_PER_FRAME * 4);
    for sample_idx in 0..SAMPLES_PER_FRAME {
        let t = (frame_idx * SAMPLES_PER_FRAME + sample_idx) as f32 / 48_000.0;
        let sample = 0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn rms(pcm: &[u8]) -> f32 {
    let samples: Vec<f32> = pcm
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn aad_for(root: &str, epoch: u64, frame_idx: u64) -> Vec<u8> {
    AadBuilder::new()
        .version(AAD_VERSION)
        .group_root(root)
        .track_label(TRACK_LABEL)
        .epoch(epoch)
        .group_sequence(0)
        .frame_index(frame_idx)
        .keyframe(frame_idx == 0)
        .build()
}

#[test]
fn three_seconds_of_audio_survive_five_percent_loss() {
    let scenario = Scenario::new("media-integrity");
    let (alice, bob) = bootstrapped(&scenario);
    let root = alice.controller.group_root().expect("root");
    let epoch = alice.controller.current_epoch().expect("epoch");

    // Both sides derive the same base key for Alice's track.
    let base_a = alice
        .controller
        .derive_media_base_key(&alice.pubkey, TRACK_LABEL)
        .expect("alice base key");
    let base_b = bob
        .controller
        .derive_media_base_key(&alice.pubkey, TRACK_LABEL)
        .expect("bob base key");
    assert_eq!(base_a, base_b);

    // Alice announces the track; Bob subscribes through the directory.
    alice.controller.announce_audio_track(TRACK_LABEL);
    scenario.settle(&[&alice, &bob], 2, Duration::from_millis(100));

    let mut sender_crypto = MediaCrypto::new(scenario.env.clone(), base_a);
    let mut counter = SenderCounter::new();
    let mut sent_rms = Vec::new();

    for frame_idx in 0..FRAMES {
        let pcm = sine_frame(frame_idx);
        sent_rms.push(rms(&pcm));
        let frame_counter = counter.issue().expect("counter");
        let aad = aad_for(&root, epoch, u64::from(frame_counter));
        let ciphertext = sender_crypto.encrypt(&pcm, frame_counter, &aad).expect("encrypt");
        let wire = MediaFrame::new(frame_counter, ciphertext).encode();

        // 5% deterministic loss.
        if frame_idx % 20 == 19 {
            continue;
        }
        alice.moq.publish_audio(TRACK_LABEL, &wire);
    }

    let received = bob.audio_frames.borrow().clone();
    assert!(
        received.len() as f64 >= FRAMES as f64 * 0.95,
        "expected >=95% of frames, got {}",
        received.len()
    );

    let mut decrypted = 0usize;
    let mut receiver_crypto = MediaCrypto::new(scenario.env.clone(), base_b);
    for (peer, label, wire) in &received {
        assert_eq!(peer, &alice.pubkey);
        assert_eq!(label, TRACK_LABEL);
        let frame = MediaFrame::decode(wire).expect("wire frame");
        let aad = aad_for(&root, epoch, u64::from(frame.counter));
        let pcm = receiver_crypto
            .decrypt(&frame.ciphertext, frame.counter, &aad)
            .expect("authenticated decrypt");
        let delta = (rms(&pcm) - sent_rms[frame.counter as usize]).abs();
        assert!(delta < 0.1, "rms drifted by {delta}");
        decrypted += 1;
    }
    assert_eq!(decrypted, received.len(), "every delivered frame decrypts");
}

#[test]
fn counter_reuse_is_structurally_impossible() {
    let mut counter = SenderCounter::new();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        assert!(seen.insert(counter.issue().expect("issue")));
    }
}

#[test]
fn generation_rollover_at_the_24_bit_boundary() {
    let scenario = Scenario::new("media-rollover");
    let (alice, _bob) = bootstrapped(&scenario);
    let root = alice.controller.group_root().expect("root");
    let epoch = alice.controller.current_epoch().expect("epoch");
    let base = alice
        .controller
        .derive_media_base_key(&alice.pubkey, TRACK_LABEL)
        .expect("base key");

    let mut sender = MediaCrypto::new(scenario.env.clone(), base);
    let mut receiver = MediaCrypto::new(scenario.env.clone(), base);

    // Last counter of generation 0 and first of generation 1.
    for counter in [0x00FF_FFFFu32, 0x0100_0000] {
        let aad = aad_for(&root, epoch, u64::from(counter));
        let ciphertext = sender.encrypt(b"roll", counter, &aad).expect("encrypt");
        let plaintext = receiver.decrypt(&ciphertext, counter, &aad).expect("decrypt");
        assert_eq!(plaintext, b"roll");
    }
}

#[test]
fn cross_epoch_audio_accepted_within_window_then_rejected() {
    let scenario = Scenario::new("media-cross-epoch");
    let (alice, bob) = bootstrapped(&scenario);
    let root = alice.controller.group_root().expect("root");
    let old_epoch = alice.controller.current_epoch().expect("epoch");

    let old_base = alice
        .controller
        .derive_media_base_key(&alice.pubkey, TRACK_LABEL)
        .expect("old base");
    let mut sender = MediaCrypto::new(scenario.env.clone(), old_base);
    let aad = aad_for(&root, old_epoch, 7);
    let in_flight = sender.encrypt(b"late frame", 7, &aad).expect("encrypt");

    let mut keyring = MediaKeyring::new(scenario.env.clone());
    keyring.install(old_epoch, old_base);

    // Alice rotates while the frame is in flight.
    alice.controller.rotate_epoch();
    scenario.settle(&[&alice, &bob], 2, Duration::from_millis(100));
    let new_epoch = bob.controller.current_epoch().expect("epoch");
    assert_eq!(new_epoch, old_epoch + 1);
    let new_base = bob
        .controller
        .derive_media_base_key(&alice.pubkey, TRACK_LABEL)
        .expect("new base");
    assert_ne!(new_base, old_base, "epoch rotation re-derives the base key");
    keyring.install(new_epoch, new_base);

    // Within the retention window the prior epoch still opens.
    let aad_builder = |epoch: u64| aad_for(&root, epoch, 7);
    let (epoch, plaintext) =
        keyring.decrypt(&in_flight, 7, aad_builder).expect("late frame accepted");
    assert_eq!(epoch, old_epoch);
    assert_eq!(plaintext, b"late frame");

    // Past the window the old key is purged and the frame is rejected.
    scenario.env.advance(Duration::from_secs(11));
    assert!(keyring.decrypt(&in_flight, 7, aad_builder).is_err());
}
