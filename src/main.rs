//! Minimal command-line front end for the session facade: scan for turnie
//! peripherals, push text or an image, or read back the stored content.
//! Anything fancier (cropping, color pickers, previews) belongs to a real
//! UI layer on top of `turnie_link::Session`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::info;
use tokio::time::{sleep, timeout};
use turnie_link::core::link::{BluestTransport, JsonFileStore, event_channel};
use turnie_link::{OutboundPayload, Session};

const CONNECT_WAIT: Duration = Duration::from_secs(15);

fn store_path() -> PathBuf {
    if let Ok(path) = std::env::var("TURNIE_LINK_STORE") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".turnie-link").join("bonded.json")
}

fn usage() -> ! {
    eprintln!("usage: turnie-link <scan | send <text> | image <rgb-hex> | get>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else { usage() };

    let (events_tx, events_rx) = event_channel();
    let transport = Arc::new(BluestTransport::new(events_tx).await?);
    let store = Arc::new(JsonFileStore::new(store_path()));
    let session = Session::spawn(transport, events_rx, store);

    match command.as_str() {
        "scan" => scan(&session).await,
        "send" => {
            let text = args.next().unwrap_or_else(|| usage());
            connect_and_send(&session, OutboundPayload::Text(text)).await
        }
        "image" => {
            let hex = args.next().unwrap_or_else(|| usage());
            let pixels = decode_hex(&hex)?;
            connect_and_send(&session, OutboundPayload::ImagePixels(pixels)).await
        }
        "get" => get_stored(&session).await,
        _ => usage(),
    }
}

async fn scan(session: &Session) -> Result<()> {
    session.start_scan().await?;
    let mut watch = session.subscribe();
    let mut seen = 0;
    let _ = timeout(Duration::from_secs(10), async {
        while watch.changed().await.is_ok() {
            let snapshot = watch.borrow().clone();
            for device in snapshot.discovered.iter().skip(seen) {
                println!("{}  {}  rssi={:?}", device.id, device.display_name(), device.rssi);
            }
            seen = snapshot.discovered.len();
        }
    })
    .await;
    session.stop_scan().await?;
    if seen == 0 {
        println!("no turnie peripherals found");
    }
    Ok(())
}

async fn wait_for_connection(session: &Session) -> Result<()> {
    let snapshot = session.snapshot();
    if !snapshot.has_previous_device {
        bail!("no bonded device on record, run `scan` and pair from a UI first");
    }
    info!("Reconnecting to {}", snapshot.device_name);
    session.reconnect_last().await?;

    let mut watch = session.subscribe();
    timeout(CONNECT_WAIT, async {
        loop {
            if watch.borrow().connected {
                return Ok::<(), anyhow::Error>(());
            }
            if let Some(error) = &watch.borrow().last_error {
                bail!("connection failed: {error}");
            }
            watch.changed().await.context("controller stopped")?;
        }
    })
    .await
    .context("timed out waiting for connection")??;
    Ok(())
}

async fn connect_and_send(session: &Session, payload: OutboundPayload) -> Result<()> {
    wait_for_connection(session).await?;
    session.send(payload).await?;
    println!("sent");
    session.disconnect().await?;
    Ok(())
}

async fn get_stored(session: &Session) -> Result<()> {
    wait_for_connection(session).await?;
    session.request_stored_data().await?;
    // The peripheral streams the content back line by line.
    sleep(Duration::from_secs(3)).await;
    print!("{}", session.snapshot().last_received_text);
    session.disconnect().await?;
    Ok(())
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        bail!("rgb-hex must have an even number of digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}
