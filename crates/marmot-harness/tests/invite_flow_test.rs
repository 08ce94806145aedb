//! Three-party invite flow and membership removal.

use std::time::Duration;

use marmot_core::controller::ChatEvent;
use marmot_harness::scenario::{
    pubkey_of, Scenario, CREATOR_SECRET, INVITEE_SECRET, THIRD_SECRET,
};

#[test]
fn three_party_invite_and_full_mesh_messaging() {
    let scenario = Scenario::new("invite-three-party");
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);
    let third_pub = pubkey_of(THIRD_SECRET);

    let alice = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub.clone()]);
    let bob =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub.clone()]);
    scenario.bootstrap(&alice, &bob);
    assert!(alice.is_ready() && bob.is_ready());

    // Alice invites Carol; Carol then joins the bootstrap channel.
    alice.controller.invite_member(third_pub.clone(), false);
    let carol =
        scenario.spawn_invitee(THIRD_SECRET, &[creator_pub.clone()], &[creator_pub.clone()]);
    carol.controller.start();
    scenario.settle(&[&alice, &bob, &carol], 20, Duration::from_millis(500));

    assert!(carol.is_ready(), "carol should finish joining");
    assert!(alice
        .events
        .borrow()
        .iter()
        .any(|e| matches!(e, ChatEvent::InviteGenerated { recipient, is_admin }
            if recipient == &third_pub && !is_admin)));

    // All three rosters agree: {A(admin), B, C}.
    for participant in [&alice, &bob, &carol] {
        let roster = participant.last_roster();
        let mut pubkeys: Vec<String> = roster.iter().map(|m| m.pubkey.clone()).collect();
        pubkeys.sort();
        let mut expected = vec![creator_pub.clone(), invitee_pub.clone(), third_pub.clone()];
        expected.sort();
        assert_eq!(pubkeys, expected);
        for member in &roster {
            assert_eq!(member.is_admin, member.pubkey == creator_pub);
        }
    }

    // Bob learned about Carol through the commit, and subscribed.
    assert!(bob.joined_members().contains(&third_pub));

    // Each pair exchanges at least one message both ways.
    alice.controller.send_message("from-alice");
    bob.controller.send_message("from-bob");
    carol.controller.send_message("from-carol");
    scenario.settle(&[&alice, &bob, &carol], 4, Duration::from_millis(100));

    assert!(alice.received_texts().contains(&"from-bob".to_string()));
    assert!(alice.received_texts().contains(&"from-carol".to_string()));
    assert!(bob.received_texts().contains(&"from-alice".to_string()));
    assert!(bob.received_texts().contains(&"from-carol".to_string()));
    assert!(carol.received_texts().contains(&"from-alice".to_string()));
    assert!(carol.received_texts().contains(&"from-bob".to_string()));
}

#[test]
fn admin_invite_propagates_to_every_member() {
    let scenario = Scenario::new("invite-admin-grant");
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);
    let third_pub = pubkey_of(THIRD_SECRET);

    let alice = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub.clone()]);
    let bob =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub.clone()]);
    scenario.bootstrap(&alice, &bob);
    assert!(alice.is_ready() && bob.is_ready());

    alice.controller.invite_member(third_pub.clone(), true);
    let carol =
        scenario.spawn_invitee(THIRD_SECRET, &[creator_pub.clone()], &[creator_pub.clone()]);
    carol.controller.start();
    scenario.settle(&[&alice, &bob, &carol], 20, Duration::from_millis(500));

    assert!(carol.is_ready(), "carol should finish joining");
    assert!(alice
        .events
        .borrow()
        .iter()
        .any(|e| matches!(e, ChatEvent::InviteGenerated { recipient, is_admin }
            if recipient == &third_pub && *is_admin)));

    // The admin grant reached every replica, not just the inviter: all
    // three rosters flag exactly {alice, carol} as admins.
    for participant in [&alice, &bob, &carol] {
        let roster = participant.last_roster();
        assert_eq!(roster.len(), 3);
        for member in &roster {
            let expect_admin = member.pubkey == creator_pub || member.pubkey == third_pub;
            assert_eq!(
                member.is_admin, expect_admin,
                "admin flag for {} diverged in one replica",
                member.pubkey
            );
        }
    }

    // Bob learned about the grant through the update, as a flag flip on
    // an existing roster entry.
    assert!(bob.events.borrow().iter().any(|e| matches!(
        e,
        ChatEvent::MemberUpdated { member } if member.pubkey == third_pub && member.is_admin
    )));

    // Carol can immediately exercise the granted right: her own invite
    // passes the admin check instead of being rejected.
    let fourth_pub =
        pubkey_of("00000000000000000000000000000000000000000000000000000000000000ff");
    carol.controller.invite_member(fourth_pub, false);
    scenario.settle(&[&alice, &bob, &carol], 1, Duration::from_millis(100));
    assert!(carol.events.borrow().iter().any(|e| matches!(
        e,
        ChatEvent::Status { text } if text.starts_with("Requesting key package")
    )));
    assert!(!carol.events.borrow().iter().any(|e| matches!(
        e,
        ChatEvent::Error { message, .. } if message.contains("admin")
    )));
}

#[test]
fn non_admin_invite_is_rejected_with_guidance() {
    let scenario = Scenario::new("invite-non-admin");
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);

    let alice = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub]);
    let bob =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub]);
    scenario.bootstrap(&alice, &bob);

    bob.controller.invite_member(pubkey_of(THIRD_SECRET), false);
    scenario.settle(&[&alice, &bob], 2, Duration::from_millis(100));

    assert!(bob.events.borrow().iter().any(|e| matches!(
        e,
        ChatEvent::Error { fatal: false, message, .. } if message.contains("admin")
    )));
}

#[test]
fn invalid_invite_inputs_are_transient_errors() {
    let scenario = Scenario::new("invite-validation");
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);

    let alice = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub.clone()]);
    let bob =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub]);
    scenario.bootstrap(&alice, &bob);

    let before = alice.fatal_errors().len();
    alice.controller.invite_member("", false);
    alice.controller.invite_member("not-a-key", false);
    alice.controller.invite_member(alice.pubkey.clone(), false);
    alice.controller.invite_member(invitee_pub, false);
    scenario.settle(&[&alice, &bob], 1, Duration::from_millis(100));

    let transient_errors = alice
        .events
        .borrow()
        .iter()
        .filter(|e| matches!(e, ChatEvent::Error { fatal: false, .. }))
        .count();
    assert_eq!(transient_errors, 4, "each bad invite surfaces one transient error");
    assert_eq!(alice.fatal_errors().len(), before, "none of them is fatal");
}

#[test]
fn removed_member_is_surfaced_and_stops() {
    let scenario = Scenario::new("invite-removal");
    let creator_pub = pubkey_of(CREATOR_SECRET);
    let invitee_pub = pubkey_of(INVITEE_SECRET);

    let alice = scenario.spawn_creator(CREATOR_SECRET, &[invitee_pub.clone()]);
    let bob =
        scenario.spawn_invitee(INVITEE_SECRET, &[creator_pub.clone()], &[creator_pub]);
    scenario.bootstrap(&alice, &bob);

    alice.controller.remove_member(invitee_pub.clone());
    scenario.settle(&[&alice, &bob], 2, Duration::from_millis(100));

    // Alice's roster now excludes Bob and surfaced the departure.
    assert!(alice.departed_members().contains(&invitee_pub));
    let roster = alice.last_roster();
    assert!(!roster.iter().any(|m| m.pubkey == invitee_pub));

    // Bob observed his own removal as fatal.
    assert!(bob.departed_members().contains(&invitee_pub));
    assert!(!bob.fatal_errors().is_empty());
}
