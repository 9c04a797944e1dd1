//! Stream management service binary.
//!
//! Operator tooling around the stream management session: inspect or clear a
//! persisted snapshot, and run a loopback simulation against an in-process
//! peer that acknowledges, drops the link and resumes.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sm_session::{
    increment, ChannelTransport, Collaborators, SmEvent, SmState, StreamManagement,
};
use sm_storage::{FileStore, FileStoreConfig, SnapshotStore, StorageMode};
use sm_wire::{Stanza, Unit};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ServiceConfig;
use logging::SmLogFormatter;

/// Stream management tooling
#[derive(Parser, Debug)]
#[command(name = "xmpp-sm", version, about = "Stream management acks and resumption")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a persisted stream snapshot
    Inspect {
        /// Snapshot file (defaults to the configured state path)
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Delete a persisted stream snapshot
    Clear {
        /// Snapshot file (defaults to the configured state path)
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Run a session against an in-process peer
    Simulate {
        /// Messages to send
        #[arg(long, default_value_t = 10)]
        units: u32,

        /// Ack request window (overrides configuration)
        #[arg(long)]
        window: Option<u32>,

        /// Delay before the peer answers an ack request, e.g. 5ms
        #[arg(long, default_value = "5ms")]
        peer_delay: humantime::Duration,

        /// Give up waiting for the peer after, e.g. 5s
        #[arg(long, default_value = "5s")]
        wait: humantime::Duration,

        /// Snapshot file (defaults to the configured state path)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("xmpp_sm={}", args.log_level).parse()?)
        .add_directive(format!("sm_session={}", args.log_level).parse()?)
        .add_directive(format!("sm_storage={}", args.log_level).parse()?)
        .add_directive(format!("sm_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(SmLogFormatter::new("sm".to_string()))
        .init();

    info!("Starting stream management tool v{}", env!("CARGO_PKG_VERSION"));

    let mut service_config = ServiceConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Inspect { state } => {
            let store = file_store(state.or(service_config.state_path), false)?;
            inspect(&store)
        }
        Command::Clear { state } => {
            let store = file_store(state.or(service_config.state_path), false)?;
            store.clear()?;
            info!("Cleared snapshot {:?}", store.path());
            Ok(())
        }
        Command::Simulate {
            units,
            window,
            peer_delay,
            wait,
            state,
        } => {
            if let Some(window) = window {
                service_config.window_size = window;
            }
            if state.is_some() {
                service_config.state_path = state;
            }
            simulate(&service_config, units, peer_delay.into(), wait.into()).await
        }
    }
}

fn file_store(path: Option<PathBuf>, fsync: bool) -> anyhow::Result<FileStore> {
    let Some(path) = path else {
        bail!("no snapshot file given; pass --state or set services.sm.state_path");
    };
    Ok(FileStore::new(FileStoreConfig { path, fsync })?)
}

fn inspect(store: &FileStore) -> anyhow::Result<()> {
    let Some(snapshot) = store.restore()? else {
        info!("No snapshot at {:?}", store.path());
        return Ok(());
    };

    info!(
        "Snapshot {:?}: owner={} resumption_id={:?} last_ack={:?} handled={:?} complete={}",
        store.path(),
        snapshot.owner,
        snapshot.resumption_id,
        snapshot.last_ack,
        snapshot.handled,
        snapshot.is_complete()
    );

    // Rebuild the session to validate every queued entry
    let (transport, _endpoints) = ChannelTransport::new();
    let config = sm_session::SmConfig {
        owner: snapshot.owner.clone(),
        ..Default::default()
    };
    let sm = StreamManagement::new(
        config,
        Collaborators::new(transport.clone(), transport).with_store(store.clone()),
    )
    .context("snapshot queue cannot be restored")?;

    for (position, unit) in sm.unacked().enumerate() {
        let id = unit.stanza().and_then(|s| s.id.as_deref()).unwrap_or("-");
        info!("  #{} {} id={}", position, unit.kind(), id);
    }
    info!("{} unacked units", sm.unacked_len());
    Ok(())
}

/// Peer side of the simulation.
///
/// Counts the client's stanzas, answers handshakes and ack requests, and
/// while `cut` is set behaves like a dead link, dropping everything except a
/// resume request.
struct Peer {
    handled: u32,
    resumable: bool,
    id: String,
    delay: Duration,
    cut: Arc<AtomicBool>,
    replies: mpsc::UnboundedSender<Unit>,
}

impl Peer {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Unit>) {
        while let Some(unit) = inbound.recv().await {
            if self.cut.load(Ordering::SeqCst) && !matches!(unit, Unit::Resume { .. }) {
                debug!(component = "peer", "Link down, lost {}", unit.kind());
                continue;
            }
            if self.handle(unit).await.is_err() {
                break;
            }
        }
        debug!(component = "peer", "Peer stopped, handled={}", self.handled);
    }

    async fn handle(&mut self, unit: Unit) -> Result<(), mpsc::error::SendError<Unit>> {
        match unit {
            Unit::Enable { resume } => {
                self.resumable = resume;
                self.handled = 0;
                info!(component = "peer", "Enabled stream {}", self.id);
                self.replies.send(Unit::Enabled {
                    id: resume.then(|| self.id.clone()),
                    resume,
                })?;
                // Some inbound traffic for the client to count and ack
                self.replies
                    .send(Unit::Presence(Stanza::new("peer-p1", "available")))?;
                self.replies
                    .send(Unit::Message(Stanza::new("peer-m1", "welcome")))?;
                self.replies.send(Unit::Request)?;
            }
            Unit::Resume { h, previd } => {
                self.cut.store(false, Ordering::SeqCst);
                if !self.resumable || previd != self.id {
                    warn!(component = "peer", "Refusing resume of {}", previd);
                    self.replies.send(Unit::Failed)?;
                    return Ok(());
                }
                info!(
                    component = "peer",
                    "Resumed {} (client handled {}, peer handled {})", previd, h, self.handled
                );
                self.replies.send(Unit::Resumed {
                    previd,
                    h: Some(self.handled),
                })?;
            }
            Unit::Request => {
                tokio::time::sleep(self.delay).await;
                self.replies.send(Unit::Ack { h: self.handled })?;
            }
            Unit::Ack { h } => {
                debug!(component = "peer", "Client acked h={}", h);
            }
            Unit::Message(_) | Unit::Presence(_) | Unit::Iq(_) => {
                self.handled = increment(self.handled);
            }
            other => {
                warn!(component = "peer", "Unexpected {} from client", other.kind());
            }
        }
        Ok(())
    }
}

/// Client side of the simulation
struct Client {
    sm: StreamManagement,
    replies: mpsc::UnboundedReceiver<Unit>,
    events: mpsc::UnboundedReceiver<SmEvent>,
    acknowledged: usize,
    wait: Duration,
}

impl Client {
    /// Feed peer replies into the session until `done` holds
    async fn pump<F>(&mut self, what: &str, done: F) -> anyhow::Result<()>
    where
        F: Fn(&StreamManagement) -> bool,
    {
        let deadline = Instant::now() + self.wait;
        while !done(&self.sm) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let unit = match timeout(remaining, self.replies.recv()).await {
                Ok(Some(unit)) => unit,
                Ok(None) => bail!("peer went away while waiting for {}", what),
                Err(_) => bail!("timed out waiting for {}", what),
            };
            if !self.sm.on_unit(&unit)? {
                debug!("Delivered inbound {} to application", unit.kind());
            }
            while let Ok(SmEvent::Acknowledged(unit)) = self.events.try_recv() {
                self.acknowledged += 1;
                debug!("Acknowledged {:?}", unit.stanza().and_then(|s| s.id.as_deref()));
            }
        }
        Ok(())
    }

    fn send_messages(&mut self, range: std::ops::Range<u32>) -> anyhow::Result<()> {
        for n in range {
            let unit = Unit::Message(Stanza::new(format!("m{}", n), format!("message {}", n)));
            self.sm.send(unit)?;
        }
        // Flush acks for a batch smaller than the window
        self.sm.send_ack_request()?;
        Ok(())
    }
}

async fn simulate(
    config: &ServiceConfig,
    units: u32,
    peer_delay: Duration,
    wait: Duration,
) -> anyhow::Result<()> {
    let store = sm_storage::open(config.storage_mode())?;
    if let StorageMode::File { path, .. } = config.storage_mode() {
        info!("Persisting stream state to {:?}", path);
    }

    let (transport, endpoints) = ChannelTransport::new();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    let cut = Arc::new(AtomicBool::new(false));

    let mut io = Collaborators::new(transport.clone(), transport);
    io.store = Some(store);
    let sm = StreamManagement::new(config.sm_config(), io)?;

    let peer = Peer {
        handled: 0,
        resumable: false,
        id: uuid::Uuid::new_v4().to_string(),
        delay: peer_delay,
        cut: cut.clone(),
        replies: replies_tx,
    };
    let peer_task = tokio::spawn(peer.run(endpoints.units));

    let mut client = Client {
        sm,
        replies: replies_rx,
        events: endpoints.events,
        acknowledged: 0,
        wait,
    };

    if client.sm.is_resumable() {
        // A fresh peer does not know the stored id and will refuse it
        info!("Stored stream found, trying to resume it");
        client.sm.resume()?;
        client
            .pump("resume answer", |sm| sm.state() != SmState::HalfOpen)
            .await?;
    }
    if !client.sm.is_started() {
        client.sm.enable()?;
        client.pump("enabled", |sm| sm.is_started()).await?;
    }

    let half = units / 2;
    client.send_messages(0..half)?;
    client
        .pump("acks for first half", |sm| sm.unacked_len() == 0)
        .await?;
    info!(
        "First {} messages acknowledged, last_ack={}",
        half,
        client.sm.last_ack()
    );

    if client.sm.is_resumable() {
        // Link drops while the rest is in flight
        cut.store(true, Ordering::SeqCst);
        client.send_messages(half..units)?;
        client.sm.teardown();
        warn!(
            "Link dropped with {} unacked messages",
            client.sm.unacked_len()
        );

        client.sm.resume()?;
        client.pump("resumed", |sm| sm.is_started()).await?;
        client.sm.send_ack_request()?;
    } else {
        info!("Stream is not resumable, sending the rest without a link drop");
        client.send_messages(half..units)?;
    }
    client
        .pump("acks for remaining messages", |sm| sm.unacked_len() == 0)
        .await?;

    info!(
        "Simulation done: sent={} acknowledged={} last_ack={} handled={}",
        units,
        client.acknowledged,
        client.sm.last_ack(),
        client.sm.handled()
    );

    drop(client);
    peer_task.await?;
    Ok(())
}
