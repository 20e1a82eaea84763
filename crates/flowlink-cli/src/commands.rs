//! Command execution
//!
//! `serve` runs an echo server: every `Text` event a client sends comes back
//! to the same session. `connect` sends a batch of texts and waits until all
//! of them were echoed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use tracing::{debug, info, warn};

use flowlink_core::{define_event, CipherTransform, Event, EventFactory};
use flowlink_link::transport::{TcpConnector, TcpRuntime, TcpServerTransport};
use flowlink_link::{LinkBuilder, LinkSessionConnected, LinkSessionDisconnected, LinkSessionRecovered};
use flowlink_runtime::{Binder, Flow, FnCase, Hub, SingleThreadFlow, TimeFlow};

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{CliError, Result};

const IO_SHUTDOWN: Duration = Duration::from_secs(1);

define_event! {
    /// Application payload echoed by the server
    pub struct Text = 1 {
        seq: u32 => set_seq,
        body: String => set_body,
    }
}

fn text(seq: u32, body: &str) -> Text {
    let mut text = Text::new();
    text.set_seq(seq).set_body(body.to_string());
    text
}

fn factory() -> EventFactory {
    let mut factory = EventFactory::new();
    factory.register::<Text>();
    factory
}

/// Link builder carrying the configured strategies
fn builder(config: &AppConfig, name: &str, hub: &Arc<Hub>) -> LinkBuilder {
    let mut link = config.runtime.link.clone();
    if link.name == flowlink_core::LinkConfig::default().name {
        link.name = name.to_string();
    }
    let mut builder = LinkBuilder::new(link, hub).factory(factory());
    if config.strategies.channel {
        builder = builder.with_channel(CipherTransform::new());
    }
    if config.strategies.heartbeat {
        builder = builder.with_heartbeat();
    }
    if config.strategies.recovery {
        builder = builder.with_recovery();
    }
    builder
}

/// Log session lifecycle notifications
fn bind_lifecycle(binder: &mut Binder) {
    binder.bind_type(|event: &LinkSessionConnected| {
        if *event.result() {
            info!("Session {} connected on {}", event.handle(), event.link());
        } else {
            warn!("Session {} failed to connect: {}", event.handle(), event.context());
        }
    });
    binder.bind_type(|event: &LinkSessionDisconnected| {
        info!("Session {} disconnected: {}", event.handle(), event.context());
    });
    binder.bind_type(|event: &LinkSessionRecovered| {
        info!("Session {} recovered", event.handle());
    });
}

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub fn execute(command: Commands, config: AppConfig) -> Result<()> {
        match command {
            Commands::Serve { bind } => serve(&config, bind),
            Commands::Connect {
                addr,
                count,
                message,
            } => connect(&config, addr, count, &message),
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Serve
// ----------------------------------------------------------------------------

fn serve(config: &AppConfig, bind: SocketAddr) -> Result<()> {
    let runtime = TcpRuntime::new()?;
    let hub = Hub::new();

    let time = TimeFlow::new("time", &hub, config.runtime.flow.clone());
    time.start_heartbeat(config.runtime.link.heartbeat.interval);
    hub.attach(time.clone())?;

    let server = builder(config, "echo-server", &hub)
        .scheduler(time)
        .build_server()?;

    let flow = SingleThreadFlow::new("echo", config.runtime.flow.clone());
    flow.add_case(server.case());
    let echo = server.clone();
    flow.add_case(Arc::new(FnCase::new("echo", move |binder: &mut Binder| {
        let echo = echo.clone();
        binder.bind_type(move |received: &Text| {
            debug!("Echoing #{} to session {}", received.seq(), received.handle());
            let reply = text(*received.seq(), received.body());
            if let Err(e) = echo.send(received.handle(), Box::new(reply)) {
                warn!("Echo to session {} failed: {}", received.handle(), e);
            }
        });
        bind_lifecycle(binder);
    })));
    hub.attach(flow)?;
    let guard = hub.startup()?;

    let listener = TcpServerTransport::listen(&runtime, bind, server.clone())?;
    info!("Listening on {}", listener.local_addr());

    runtime.handle().block_on(tokio::signal::ctrl_c())?;
    info!("Shutting down");

    server.close();
    listener.shutdown();
    guard.shutdown();
    runtime.shutdown(IO_SHUTDOWN);
    Ok(())
}

// ----------------------------------------------------------------------------
// Connect
// ----------------------------------------------------------------------------

fn connect(config: &AppConfig, addr: SocketAddr, count: u32, message: &str) -> Result<()> {
    let runtime = TcpRuntime::new()?;
    let hub = Hub::new();
    let (replies_tx, replies) = channel::unbounded();

    let time = TimeFlow::new("time", &hub, config.runtime.flow.clone());
    time.start_heartbeat(config.runtime.link.heartbeat.interval);
    hub.attach(time)?;

    let client =
        builder(config, "echo-client", &hub).build_client(TcpConnector::new(&runtime, addr))?;

    let flow = SingleThreadFlow::new("replies", config.runtime.flow.clone());
    flow.add_case(client.case());
    flow.add_case(Arc::new(FnCase::new("replies", move |binder: &mut Binder| {
        let replies_tx = replies_tx.clone();
        binder.bind_type(move |reply: &Text| {
            let _ = replies_tx.send((*reply.seq(), reply.body().clone()));
        });
        bind_lifecycle(binder);
    })));
    hub.attach(flow)?;
    let guard = hub.startup()?;

    let timeout = config.runtime.link.connect_timeout;
    let handle = client.connect_and_wait(timeout)?;
    info!("Connected to {} as session {}", addr, handle);

    let started = Instant::now();
    for seq in 0..count {
        client.send(Box::new(text(seq, message)))?;
    }

    let deadline = started + timeout;
    let mut echoed = 0;
    let outcome = loop {
        if echoed == count {
            break Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match replies.recv_timeout(remaining) {
            Ok((seq, body)) => {
                echoed += 1;
                println!("#{seq}: {body}");
            }
            Err(_) => {
                break Err(CliError::Timeout(format!(
                    "{} of {} echoes",
                    count - echoed,
                    count
                )))
            }
        }
    };
    if outcome.is_ok() {
        info!("{} echoes in {:?}", count, started.elapsed());
    }

    client.close();
    guard.shutdown();
    runtime.shutdown(IO_SHUTDOWN);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_survives_the_factory() {
        let original = text(3, "hello");
        let mut bytes = Vec::new();
        original.serialize(&mut bytes).unwrap();

        let mut decoded = factory().create(Text::TYPE_ID).unwrap();
        decoded.deserialize(&mut bytes.as_slice()).unwrap();
        let decoded = decoded.downcast_ref::<Text>().unwrap();
        assert_eq!(*decoded.seq(), 3);
        assert_eq!(decoded.body(), "hello");
    }

    #[test]
    fn test_builder_names_unnamed_links() {
        let hub = Hub::new();
        let server = builder(&AppConfig::default(), "echo-server", &hub)
            .build_server()
            .unwrap();
        assert_eq!(server.name(), "echo-server");

        let mut config = AppConfig::default();
        config.runtime.link.name = "custom".to_string();
        let server = builder(&config, "echo-server", &hub).build_server().unwrap();
        assert_eq!(server.name(), "custom");
    }
}
