use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use conclave::{RelayRoom, TcpSession, TcpSessionConnector, load_state, store_state};

#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(author, version, about = "Multi-party chat relay over point-to-point sessions", long_about = None)]
struct Args {
    /// Address to listen on for incoming peer sessions.
    #[arg(short, long, default_value = "127.0.0.1:9878")]
    listen: SocketAddr,

    /// Identity announced to peers.
    #[arg(short, long, default_value = "conclave")]
    identity: String,

    /// Path of the persisted room state.
    #[arg(short, long, default_value = "room_state.json")]
    state: PathBuf,

    /// Accept contact requests from unknown peers.
    #[arg(long)]
    allow_connections: bool,

    /// Honor the in-band /invite command.
    #[arg(long)]
    allow_invites: bool,

    /// Give authenticated peers a generated placeholder nickname.
    #[arg(long)]
    generated_nicks: bool,

    /// Announce joins and parts to the room.
    #[arg(long)]
    join_part_notifications: bool,

    /// Deliver to known contacts, queueing messages for offline ones.
    #[arg(long)]
    replay_offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut state = load_state(&args.state).await;

    // Flags only enable policies; anything already persisted stays on.
    state.config.allow_unsolicited_connections |= args.allow_connections;
    state.config.allow_invite_command |= args.allow_invites;
    state.config.use_generated_nicknames |= args.generated_nicks;
    state.config.announce_join_part |= args.join_part_notifications;
    state.config.replay_to_offline_contacts |= args.replay_offline;

    let connector = Arc::new(TcpSessionConnector::new(args.identity.clone()));
    let room = RelayRoom::restore(connector, state);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, identity = %args.identity, "listening for peer sessions");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, persisting room state");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "inbound session");
                        let (session, events) =
                            TcpSession::spawn(stream, args.identity.clone(), false);
                        if let Err(e) = room.attach(session, events).await {
                            warn!(error = %e, "failed to attach session");
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    match room.snapshot().await {
        Ok(state) => {
            if let Err(e) = store_state(&args.state, &state).await {
                warn!(error = %e, "failed to persist room state");
            }
        }
        Err(e) => warn!(error = %e, "failed to snapshot room state"),
    }
    room.quit().await;

    Ok(())
}
