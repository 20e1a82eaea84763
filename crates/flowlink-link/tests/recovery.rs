//! Session recovery across dropped connections

mod common;

use std::time::Duration;

use common::{chat, pair, pair_with, Endpoint, Options, Pair, Record};
use flowlink_core::CipherTransform;
use flowlink_link::{MemoryPipe, Side, Stage};

fn recovery_pair() -> Pair {
    let pair = pair(Options {
        recovery: true,
        ..Options::default()
    });
    pair.connect();
    pair.client_end.drain();
    pair.server_end.drain();
    pair
}

/// Let everything `side` has queued (and whatever follows it) go out and
/// vanish
fn lose_all(pipe: &MemoryPipe, side: Side) {
    while pipe.drop_in_flight(side) > 0 {}
}

#[test]
fn test_new_session_gets_a_shared_token() {
    let pair = recovery_pair();
    let token = pair.client_session().token();
    assert_eq!(token.len(), 32);
    assert_eq!(pair.server_session().token(), token);
    assert_eq!(pair.server.core().registry().token_count(), 1);
}

#[test]
fn test_dropped_frames_are_retransmitted_after_recovery() {
    let pair = recovery_pair();
    let pipe = pair.pipe();

    for seq in 0..5 {
        pair.client.send(chat(seq)).unwrap();
    }
    pair.pump();
    assert_eq!(Endpoint::chats(&pair.server_end.drain()), vec![0, 1, 2, 3, 4]);

    // Three client frames and two server frames leave and never arrive
    for seq in 5..8 {
        pair.client.send(chat(seq)).unwrap();
    }
    pair.server.send(1, chat(100)).unwrap();
    pair.server.send(1, chat(101)).unwrap();
    lose_all(&pipe, Side::Client);
    lose_all(&pipe, Side::Server);

    let client_before = pair.client_session().counters();
    assert_eq!((client_before.rx, client_before.tx), (0, 8));
    let server_before = pair.server_session().counters();
    assert_eq!((server_before.rx, server_before.tx), (5, 2));

    pipe.disconnect();
    assert!(pair.client.is_recovering());
    // Recovery expiry for the old session, setup deadline for the new one
    assert_eq!(pair.timer.pending(), 2);
    pair.pump();

    assert!(pair.client.is_connected());
    assert!(!pair.client.is_recovering());
    assert_eq!(pair.client.handle(), 1);
    assert!(pair.client_session().is_recovered());
    assert_eq!(pair.timer.pending(), 0);

    assert_eq!(
        pair.server_end.drain(),
        vec![
            Record::Recovered { handle: 1 },
            Record::Chat { handle: 1, seq: 5 },
            Record::Chat { handle: 1, seq: 6 },
            Record::Chat { handle: 1, seq: 7 },
        ]
    );
    assert_eq!(
        pair.client_end.drain(),
        vec![
            Record::Recovered { handle: 1 },
            Record::Chat { handle: 1, seq: 100 },
            Record::Chat { handle: 1, seq: 101 },
        ]
    );

    let server = pair.server_session();
    assert_eq!(server.handle(), 1);
    assert_eq!(server.stage(), Stage::Established);
    assert_eq!((server.counters().rx, server.counters().tx), (8, 2));

    // The recovered session carries on as usual
    pair.client.send(chat(8)).unwrap();
    pair.pump();
    assert_eq!(Endpoint::chats(&pair.server_end.drain()), vec![8]);
    assert_eq!(pair.client_session().counters().tx, 9);
}

#[test]
fn test_each_side_resends_exactly_what_the_other_missed() {
    let pair = recovery_pair();
    let pipe = pair.pipe();

    for seq in 0..5 {
        pair.client.send(chat(seq)).unwrap();
    }
    for seq in 100..106 {
        pair.server.send(1, chat(seq)).unwrap();
    }
    pair.pump();
    assert_eq!(Endpoint::chats(&pair.server_end.drain()).len(), 5);
    assert_eq!(Endpoint::chats(&pair.client_end.drain()).len(), 6);

    pair.client.send(chat(5)).unwrap();
    pair.client.send(chat(6)).unwrap();
    pair.server.send(1, chat(106)).unwrap();
    lose_all(&pipe, Side::Client);
    lose_all(&pipe, Side::Server);

    let server_before = pair.server_session().counters();
    assert_eq!((server_before.rx, server_before.tx), (5, 7));
    let client_before = pair.client_session().counters();
    assert_eq!((client_before.rx, client_before.tx), (6, 7));

    // Server resends one frame and expects two
    pipe.disconnect();
    pair.pump();

    assert_eq!(
        pair.server_end.drain(),
        vec![
            Record::Recovered { handle: 1 },
            Record::Chat { handle: 1, seq: 5 },
            Record::Chat { handle: 1, seq: 6 },
        ]
    );
    assert_eq!(
        pair.client_end.drain(),
        vec![
            Record::Recovered { handle: 1 },
            Record::Chat { handle: 1, seq: 106 },
        ]
    );
    let server = pair.server_session().counters();
    assert_eq!((server.rx, server.tx), (7, 7));
    let client = pair.client_session().counters();
    assert_eq!((client.rx, client.tx), (7, 7));
}

#[test]
fn test_unanswered_session_request_fails_the_client() {
    let pair = pair_with(
        Options {
            recovery: true,
            ..Options::default()
        },
        CipherTransform::new,
        |config| config.channel.handshake_timeout = Duration::ZERO,
    );
    pair.client.connect().unwrap();
    // The session request never leaves the client
    pair.pipe().drop_in_flight(Side::Client);
    assert_eq!(pair.client_session().stage(), Stage::Recovery);

    pair.client.on_heartbeat();
    assert!(pair.client.session().is_none());
    assert_eq!(
        pair.client_end.drain(),
        vec![Record::Connected {
            handle: 1,
            result: false
        }]
    );
}

#[test]
fn test_sends_during_recovery_follow_retransmissions() {
    let pair = recovery_pair();
    let pipe = pair.pipe();

    pair.client.send(chat(1)).unwrap();
    pair.client.send(chat(2)).unwrap();
    lose_all(&pipe, Side::Client);
    pipe.disconnect();

    // Neither side has resumed yet
    pair.client.send(chat(3)).unwrap();
    pair.server.send(1, chat(200)).unwrap();
    pair.pump();

    assert_eq!(Endpoint::chats(&pair.server_end.drain()), vec![1, 2, 3]);
    assert_eq!(Endpoint::chats(&pair.client_end.drain()), vec![200]);
}

#[test]
fn test_recovery_is_refused_when_the_window_was_exceeded() {
    let pair = pair_with(
        Options {
            recovery: true,
            ..Options::default()
        },
        CipherTransform::new,
        |config| config.recovery.retransmission_window = 3,
    );
    pair.connect();
    pair.client_end.drain();
    pair.server_end.drain();
    let old_token = pair.client_session().token();
    let pipe = pair.pipe();

    // Five server frames lost but only three retained
    for seq in 0..5 {
        pair.server.send(1, chat(seq)).unwrap();
    }
    lose_all(&pipe, Side::Server);
    assert_eq!(pair.server_session().counters().buffered, 3);

    pipe.disconnect();
    pair.pump();

    assert!(pair.client.is_connected());
    assert!(!pair.client_session().is_recovered());
    assert_ne!(pair.client_session().token(), old_token);
    assert_eq!(pair.server_session().token(), pair.client_session().token());
    assert_eq!(
        pair.server_end.drain(),
        vec![
            Record::Disconnected { handle: 1 },
            Record::Connected {
                handle: 2,
                result: true
            },
        ]
    );
    assert_eq!(
        pair.client_end.drain(),
        vec![
            Record::Disconnected { handle: 1 },
            Record::Connected {
                handle: 2,
                result: true
            },
        ]
    );
    assert!(pair.server.core().registry().lookup(&old_token).is_none());
}

#[test]
fn test_dropped_session_expires_on_the_server() {
    let pair = recovery_pair();
    pair.connector.set_refuse(true);
    pair.pipe().disconnect();

    // The client could not reconnect and gave up at once
    assert!(!pair.client.is_recovering());
    assert_eq!(
        pair.client_end.drain(),
        vec![
            Record::Connected {
                handle: 0,
                result: false
            },
            Record::Disconnected { handle: 1 },
        ]
    );

    // The server keeps the session until the timer fires
    assert_eq!(pair.server.sessions().len(), 1);
    assert!(pair.server_end.drain().is_empty());

    pair.expire_timers(Duration::from_secs(1));
    let mut records = pair.server_end.drain();
    records.extend(pair.server_end.drain());
    assert_eq!(records, vec![Record::Disconnected { handle: 1 }]);
    assert!(pair.server.sessions().is_empty());
    assert_eq!(pair.server.core().registry().token_count(), 0);
}

#[test]
fn test_clean_close_is_not_recovered() {
    let pair = recovery_pair();
    pair.client.close();
    pair.pump();

    assert_eq!(pair.connector.pipes().len(), 1);
    assert_eq!(pair.timer.pending(), 0);
    assert!(pair.server.sessions().is_empty());
    assert_eq!(
        pair.server_end.drain(),
        vec![Record::Disconnected { handle: 1 }]
    );
    assert_eq!(
        pair.client_end.drain(),
        vec![Record::Disconnected { handle: 1 }]
    );
}

#[test]
fn test_heartbeat_drop_is_recovered() {
    let pair = pair(Options {
        heartbeat: true,
        recovery: true,
        ..Options::default()
    });
    pair.connect();
    pair.client_end.drain();
    pair.server_end.drain();

    pair.server.on_heartbeat();
    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().stage(), Stage::Closed);

    pair.pump();
    assert!(pair.client.is_connected());
    assert_eq!(pair.connector.pipes().len(), 2);
    assert_eq!(pair.server_end.drain(), vec![Record::Recovered { handle: 1 }]);
    assert_eq!(pair.client_end.drain(), vec![Record::Recovered { handle: 1 }]);
}

#[test]
fn test_encrypted_session_recovers_with_its_channel() {
    let pair = pair(Options {
        channel: true,
        recovery: true,
        ..Options::default()
    });
    pair.connect();
    pair.client_end.drain();
    pair.server_end.drain();
    let pipe = pair.pipe();
    assert_eq!(pair.server_session().channel_ready(), (true, true));

    pair.client.send(chat(1)).unwrap();
    lose_all(&pipe, Side::Client);
    pipe.disconnect();
    pair.pump();

    assert_eq!(pair.client_session().channel_ready(), (true, true));
    pair.client.send(chat(2)).unwrap();
    pair.pump();
    let records = pair.server_end.drain();
    assert_eq!(records[0], Record::Recovered { handle: 1 });
    assert_eq!(Endpoint::chats(&records), vec![1, 2]);
}
