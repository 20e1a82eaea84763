//! Shared harness: a client and a server link joined by memory pipes, each
//! with its own hub and a threadless flow recording what the link posts.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flowlink_core::{
    define_event, BufferTransform, CipherTransform, Event, EventFactory, FlowConfig, LinkConfig,
};
use flowlink_link::{
    ClientLink, LinkBuilder, LinkSession, LinkSessionConnected, LinkSessionDisconnected,
    LinkSessionRecovered, MemoryConnector, MemoryPipe, ServerLink,
};
use flowlink_runtime::{Binder, Case, Flow, FnCase, Hub, ThreadlessFlow, Timer};

define_event! {
    pub struct Chat = 100 {
        seq: u32 => set_seq,
    }
}

pub fn chat(seq: u32) -> Box<Chat> {
    let mut chat = Chat::new();
    chat.set_seq(seq);
    Box::new(chat)
}

pub fn factory() -> EventFactory {
    let mut factory = EventFactory::new();
    factory.register::<Chat>();
    factory
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// What a link posted to its hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Chat { handle: u64, seq: u32 },
    Connected { handle: u64, result: bool },
    Disconnected { handle: u64 },
    Recovered { handle: u64 },
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

pub struct Endpoint {
    pub hub: Arc<Hub>,
    pub flow: Arc<ThreadlessFlow>,
    records: Arc<Mutex<Vec<Record>>>,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        let records = Arc::new(Mutex::new(Vec::new()));
        let flow = ThreadlessFlow::new(name, FlowConfig::testing());
        let sink = records.clone();
        flow.add_case(Arc::new(FnCase::new("record", move |binder: &mut Binder| {
            let sink = sink.clone();
            record_into(binder, move |record| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(record);
            });
        })));
        Self {
            hub: Hub::new(),
            flow,
            records,
        }
    }

    fn start(&self, link_case: Arc<dyn Case>) {
        self.flow.add_case(link_case);
        self.hub.attach(self.flow.clone()).unwrap();
        self.flow.start().unwrap();
    }

    /// Dispatch everything posted so far and return the new records
    pub fn drain(&self) -> Vec<Record> {
        self.flow.try_dispatch_all();
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn chats(records: &[Record]) -> Vec<u32> {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Chat { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }
}

/// Bind handlers turning chats and link notifications into records
pub fn record_into<S>(binder: &mut Binder, push: S)
where
    S: Fn(Record) + Clone + Send + Sync + 'static,
{
    let chat_sink = push.clone();
    binder.bind_type(move |chat: &Chat| {
        chat_sink(Record::Chat {
            handle: chat.handle(),
            seq: *chat.seq(),
        });
    });
    let connected_sink = push.clone();
    binder.bind_type(move |event: &LinkSessionConnected| {
        connected_sink(Record::Connected {
            handle: event.handle(),
            result: *event.result(),
        });
    });
    let disconnected_sink = push.clone();
    binder.bind_type(move |event: &LinkSessionDisconnected| {
        disconnected_sink(Record::Disconnected {
            handle: event.handle(),
        });
    });
    binder.bind_type(move |event: &LinkSessionRecovered| {
        push(Record::Recovered {
            handle: event.handle(),
        });
    });
}

// ----------------------------------------------------------------------------
// Pair
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub channel: bool,
    pub heartbeat: bool,
    pub recovery: bool,
}

pub struct Pair {
    pub client_end: Endpoint,
    pub server_end: Endpoint,
    pub timer: Arc<Timer>,
    pub server: ServerLink,
    pub client: ClientLink,
    pub connector: Arc<MemoryConnector>,
}

pub fn pair(options: Options) -> Pair {
    pair_with(options, CipherTransform::new, |_| {})
}

/// Build a pair with a custom channel transform and config tweaks
pub fn pair_with<T, F>(options: Options, transform: fn() -> T, tweak: F) -> Pair
where
    T: BufferTransform + 'static,
    F: Fn(&mut LinkConfig),
{
    init_tracing();
    let client_end = Endpoint::new("client-flow");
    let server_end = Endpoint::new("server-flow");
    let timer = Arc::new(Timer::new());

    let mut server_config = LinkConfig::testing("server");
    tweak(&mut server_config);
    let mut server = LinkBuilder::new(server_config, &server_end.hub)
        .factory(factory())
        .scheduler(timer.clone());
    let mut client_config = LinkConfig::testing("client");
    tweak(&mut client_config);
    let mut client = LinkBuilder::new(client_config, &client_end.hub).factory(factory());

    if options.channel {
        server = server.with_channel(transform());
        client = client.with_channel(transform());
    }
    if options.heartbeat {
        server = server.with_heartbeat();
        client = client.with_heartbeat();
    }
    if options.recovery {
        server = server.with_recovery();
        client = client.with_recovery();
    }

    let server = server.build_server().unwrap();
    let connector = MemoryConnector::new(server.clone());
    let client = client.build_client(connector.clone()).unwrap();

    server_end.start(server.case());
    client_end.start(client.case());

    Pair {
        client_end,
        server_end,
        timer,
        server,
        client,
        connector,
    }
}

impl Pair {
    /// Move bytes until every pipe is quiescent
    pub fn pump(&self) -> usize {
        self.connector.pump()
    }

    pub fn connect(&self) {
        self.client.connect().unwrap();
        self.pump();
        assert!(self.client.is_connected(), "client did not connect");
    }

    pub fn pipe(&self) -> MemoryPipe {
        self.connector.latest().unwrap()
    }

    pub fn server_session(&self) -> Arc<LinkSession> {
        let sessions = self.server.sessions();
        assert_eq!(sessions.len(), 1, "expected one server session");
        sessions[0].clone()
    }

    pub fn client_session(&self) -> Arc<LinkSession> {
        self.client.session().unwrap()
    }

    /// Fire the server's recovery timers as if `after` had elapsed
    pub fn expire_timers(&self, after: Duration) {
        let hub = self.server_end.hub.clone();
        self.timer.tick_at(Instant::now() + after, &mut |event: Box<dyn Event>| {
            hub.post(event);
        });
    }
}
