//! Builtin protocol events
//!
//! These events drive the link-layer strategies. They are always sent with the
//! transform-eligible flag cleared so handshakes travel in the clear, and they
//! use negative type ids so they never collide with application events.

use crate::define_event;
use crate::factory::EventFactory;

define_event! {
    /// Keepalive on the wire, and the hub's periodic tick inside a process
    pub struct HeartbeatEvent = -1 {}
}

define_event! {
    /// Channel handshake, first leg (initiator -> responder)
    pub struct HandshakeReq = -10 {
        data: Vec<u8> => set_data,
    }
}

define_event! {
    /// Channel handshake, second leg (responder -> initiator)
    pub struct HandshakeResp = -11 {
        data: Vec<u8> => set_data,
    }
}

define_event! {
    /// Channel handshake, final leg (initiator -> responder)
    pub struct HandshakeAck = -12 {
        result: bool => set_result,
    }
}

define_event! {
    /// Session recovery request; an empty token asks for a new session
    pub struct SessionReq = -20 {
        token: String => set_token,
        rx_counter: u64 => set_rx_counter,
        tx_counter: u64 => set_tx_counter,
        tx_buffered: u64 => set_tx_buffered,
    }
}

define_event! {
    /// Session recovery response carrying the (possibly new) token
    pub struct SessionResp = -21 {
        token: String => set_token,
        retransmission: u64 => set_retransmission,
    }
}

define_event! {
    /// Client confirmation closing the recovery handshake
    pub struct SessionAck = -22 {
        recovered: bool => set_recovered,
    }
}

define_event! {
    /// Clean end of a session; the peer must not try to recover it
    pub struct SessionEnd = -23 {}
}

/// Register every builtin event with `factory`
pub fn register_builtins(factory: &mut EventFactory) {
    factory
        .register::<HeartbeatEvent>()
        .register::<HandshakeReq>()
        .register::<HandshakeResp>()
        .register::<HandshakeAck>()
        .register::<SessionReq>()
        .register::<SessionResp>()
        .register::<SessionAck>()
        .register::<SessionEnd>();
}

/// Whether `type_id` belongs to a builtin protocol event
pub fn is_builtin(type_id: i32) -> bool {
    type_id < 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn test_builtin_type_ids_are_negative_and_unique() {
        let factory = EventFactory::with_builtins();
        assert_eq!(factory.len(), 8);
        for type_id in [
            HeartbeatEvent::TYPE_ID,
            HandshakeReq::TYPE_ID,
            HandshakeResp::TYPE_ID,
            HandshakeAck::TYPE_ID,
            SessionReq::TYPE_ID,
            SessionResp::TYPE_ID,
            SessionAck::TYPE_ID,
            SessionEnd::TYPE_ID,
        ] {
            assert!(is_builtin(type_id));
            assert!(factory.contains(type_id));
        }
    }

    #[test]
    fn test_session_req_fields() {
        let mut req = SessionReq::new();
        req.set_token("abc".to_string())
            .set_rx_counter(5)
            .set_tx_counter(7)
            .set_tx_buffered(3);

        let mut bytes = Vec::new();
        req.serialize(&mut bytes).unwrap();

        let mut decoded = SessionReq::new();
        decoded.deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded.token(), "abc");
        assert_eq!(*decoded.rx_counter(), 5);
        assert_eq!(*decoded.tx_counter(), 7);
        assert_eq!(*decoded.tx_buffered(), 3);
    }

    #[test]
    fn test_empty_events_serialize_to_fingerprint_only() {
        let mut bytes = Vec::new();
        SessionEnd::new().serialize(&mut bytes).unwrap();
        assert_eq!(bytes, vec![0]);
    }
}
