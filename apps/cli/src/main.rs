use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{PresenceSession, SessionEvent};
use shared::domain::ClientId;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    /// Drag the own marker to this position once registered, as "X,Y".
    #[arg(long)]
    move_to: Option<String>,
    /// Send one private message once registered, as "PEER_ID:TEXT".
    #[arg(long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let session = PresenceSession::new(args.server_url.clone());
    let mut events = session.subscribe_events();
    session.connect().await?;

    let mut scripted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.disconnect().await;
                break;
            }
            event = events.recv() => {
                let Ok(event) = event else { break };
                print_event(&event);
                if !scripted && session.own_id().await.is_some() {
                    scripted = true;
                    run_script(&session, &args).await?;
                }
                if matches!(event, SessionEvent::Disconnected { .. }) {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn run_script(session: &Arc<PresenceSession>, args: &Args) -> Result<()> {
    if let Some(move_to) = &args.move_to {
        let (x, y) = parse_pair(move_to)?;
        let own = session.own_id().await.context("own identifier missing")?;
        let origin = session
            .roster_snapshot()
            .await
            .into_iter()
            .find(|marker| marker.client_id == own)
            .map(|marker| marker.position)
            .context("own marker missing")?;
        session.begin_drag(origin.pagex, origin.pagey).await?;
        session.drag_to(x, y).await;
        session.end_drag().await;
        println!("moved own marker to ({x}, {y})");
    }

    if let Some(message) = &args.message {
        let (peer, text) = message
            .split_once(':')
            .context("expected PEER_ID:TEXT")?;
        let peer = ClientId::from(peer);
        session.open_conversation(peer.clone()).await;
        session.load_history(peer.clone());
        session.send_private(text).await?;
        println!("sent private message to {peer}");
    }

    Ok(())
}

fn parse_pair(raw: &str) -> Result<(f64, f64)> {
    let (x, y) = raw.split_once(',').context("expected X,Y")?;
    Ok((
        x.trim().parse().context("invalid X")?,
        y.trim().parse().context("invalid Y")?,
    ))
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected => println!("connected"),
        SessionEvent::Disconnected { clean } => println!("disconnected (clean: {clean})"),
        SessionEvent::RosterChanged { markers } => {
            println!("{} marker(s):", markers.len());
            for marker in markers {
                println!(
                    "  {} {:?} at ({}, {})",
                    marker.client_id, marker.coloring, marker.position.pagex, marker.position.pagey
                );
            }
        }
        SessionEvent::PrivateReceived { from, msg } => println!("{from}> {msg}"),
        SessionEvent::HistoryLoaded { with, records } => {
            println!("history with {with} ({} lines):", records.len());
            for record in records {
                println!("  {}> {}", record.from, record.msg);
            }
        }
        SessionEvent::Error(message) => eprintln!("error: {message}"),
    }
}
