//! collab-gate - terminal client for an opt-in sync room
//!
//! Usage: `collab-gate <page-url>`
//!
//! The room comes from the page URL's room parameter. Without one, a share URL
//! for a fresh room is printed and nothing connects.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use collab_gate::health::{HealthConfig, HealthPoller, HealthStatus, ServiceCheck};
use collab_gate::room::{generate_room_id, share_url, BufferSurface, EditingSurface};
use collab_gate::sync::broadcast::BroadcastHub;
use collab_gate::sync::state::{StatusChannel, StatusView};
use collab_gate::sync::ws::WsTransport;
use collab_gate::{CollabLayer, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_gate=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let page_url = std::env::args()
        .nth(1)
        .context("usage: collab-gate <page-url>")?;
    let config = SyncConfig::from_env()?;

    let (status, mut status_rx) = StatusChannel::new();
    let hub = BroadcastHub::new();
    let layer = CollabLayer::start(&page_url, &config, WsTransport, Arc::new(status), Some(&hub));

    let CollabLayer::Active(active) = &layer else {
        let room = generate_room_id();
        let link = share_url(&page_url, &config.room_param, &room)?;
        println!("No room in this URL. Start one by opening:\n{}", link);
        return Ok(());
    };

    println!(
        "Room {}: type to edit, /sync to toggle sync, /show to print, /quit to leave",
        active.room
    );

    let surface = BufferSurface::new("");
    active.session.bind_surface(surface.clone());

    let css_prefix = config.css_prefix.clone();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let snapshot = *status_rx.borrow();
            let view = StatusView::new(snapshot.state, &css_prefix);
            match snapshot.participants {
                Some(count) => info!(
                    "{} ({} in room) [{}]",
                    view.label, count, view.indicator_class
                ),
                None => info!("{} [{}]", view.label, view.indicator_class),
            }
        }
    });

    if let Ok(url) = std::env::var("COLLAB_HEALTH_URL") {
        let config = HealthConfig::new(vec![ServiceCheck::new("room-server", url)]);
        let (mut health_rx, _poller) = HealthPoller::new(config)?.spawn();
        tokio::spawn(async move {
            while health_rx.changed().await.is_ok() {
                for result in health_rx.borrow().iter() {
                    if result.status != HealthStatus::Online {
                        warn!("{} is {:?}: {:?}", result.name, result.status, result.error);
                    }
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/sync" => {
                let state = active.session.toggle_sync();
                println!("{}", StatusView::new(state, &config.css_prefix).label);
            }
            "/show" => println!("{}", surface.get_value()),
            "/quit" => break,
            _ => {
                let mut text = surface.get_value();
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&line);
                surface.edit(text);
            }
        }
    }

    layer.shutdown().await;
    info!("Bye");
    Ok(())
}
