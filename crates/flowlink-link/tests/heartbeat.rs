//! Keepalive behaviour on established sessions

mod common;

use common::{chat, pair, Options, Record};
use flowlink_core::WireBuffer;
use flowlink_link::Stage;
use flowlink_runtime::Hub;

fn heartbeat_pair() -> common::Pair {
    let pair = pair(Options {
        heartbeat: true,
        ..Options::default()
    });
    pair.connect();
    pair.client_end.drain();
    pair.server_end.drain();
    pair
}

#[test]
fn test_idle_peers_keep_each_other_alive() {
    let pair = heartbeat_pair();
    for _ in 0..6 {
        pair.client.on_heartbeat();
        pair.server.on_heartbeat();
        pair.pump();
    }
    // Ticks measure the traffic of the previous round
    pair.client.on_heartbeat();
    pair.server.on_heartbeat();

    assert!(pair.client.is_connected());
    assert_eq!(pair.client_session().heartbeat_failures(), Some(0));
    assert_eq!(pair.server_session().heartbeat_failures(), Some(0));
    assert!(pair.client_end.drain().is_empty());
    assert!(pair.server_end.drain().is_empty());
}

#[test]
fn test_silent_peer_is_dropped_at_threshold() {
    let pair = heartbeat_pair();

    // The client never ticks and nothing is pumped
    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(1));
    assert_eq!(pair.server_session().stage(), Stage::Established);
    pair.server.on_heartbeat();

    assert!(pair.server.sessions().is_empty());
    assert_eq!(
        pair.server_end.drain(),
        vec![Record::Disconnected { handle: 1 }]
    );

    pair.pump();
    assert!(!pair.client.is_connected());
    assert_eq!(
        pair.client_end.drain(),
        vec![Record::Disconnected { handle: 1 }]
    );
}

#[test]
fn test_application_traffic_resets_failures() {
    let pair = heartbeat_pair();
    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(1));

    pair.client.send(chat(1)).unwrap();
    pair.pump();
    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(0));
}

#[test]
fn test_undecodable_frames_still_count_as_traffic() {
    let pair = heartbeat_pair();
    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(1));

    let mut segment = Vec::new();
    WireBuffer::new(vec![0xab, 0xcd], false).write_to(&mut segment);
    pair.server_session().on_received(&segment);
    assert!(pair.server_end.drain().is_empty());

    pair.server.on_heartbeat();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(0));
    assert_eq!(pair.server_session().stage(), Stage::Established);
}

#[test]
fn test_hub_tick_drives_the_link() {
    let pair = heartbeat_pair();
    assert_eq!(pair.server_end.hub.post(Hub::heartbeat_event()), 1);
    pair.server_end.drain();
    assert_eq!(pair.server_session().heartbeat_failures(), Some(1));
}

#[test]
fn test_no_heartbeat_before_established() {
    let pair = pair(Options {
        heartbeat: true,
        channel: true,
        ..Options::default()
    });
    pair.client.connect().unwrap();
    let pipe = pair.pipe();

    // Handshake still in flight; ticks neither count nor send
    for _ in 0..4 {
        pair.client.on_heartbeat();
    }
    assert_eq!(pair.client_session().heartbeat_failures(), Some(0));
    assert_eq!(pipe.in_flight(flowlink_link::Side::Client), 1);

    pair.pump();
    assert!(pair.client.is_connected());
}
