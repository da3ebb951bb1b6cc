#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dcops::engine::{
    ClientEvent, Engine, EngineSettings, Inventory, ServerEvent, StaticInventory,
};
use dotenv::dotenv;
use futures::{SinkExt, StreamExt};
use poem::web::Data;
use poem::web::websocket::{Message, WebSocket};
use poem::{
    EndpointExt, IntoResponse, Route, Server, get, handler, listener::TcpListener,
    middleware::Tracing,
};
use tracing::{debug, info, warn};

const PORT_ENV_VAR: &str = "DCOPS_PORT";
const INVENTORY_ENV_VAR: &str = "DCOPS_INVENTORY";
const DEFAULT_PORT: u16 = 8000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[handler]
fn health() -> &'static str {
    "ok"
}

/// One WebSocket per client; JSON frames in both directions.
#[handler]
fn events(ws: WebSocket, engine: Data<&Arc<Engine>>) -> impl IntoResponse {
    let engine = engine.0.clone();
    ws.on_upgrade(move |socket| async move {
        let (client, mut outgoing) = engine.connect();
        let (mut sink, mut stream) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(event) = outgoing.recv().await {
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping event: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match ClientEvent::from_frame(&text) {
                    Ok(event) => engine.handle(&client, event).await,
                    Err(e) => {
                        debug!("Client {} sent a bad frame: {}", client, e);
                        engine.send(
                            &client,
                            ServerEvent::SessionError {
                                message: e.to_string(),
                            },
                        );
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Client {} socket error: {}", client, e);
                    break;
                }
            }
        }

        // Dropping the subscription closes `outgoing`, which ends the writer.
        engine.disconnect(&client).await;
        let _ = writer.await;
    })
}

fn load_inventory() -> Result<Arc<dyn Inventory>, Box<dyn std::error::Error>> {
    match std::env::var(INVENTORY_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => {
            info!("Loading device inventory from {}", path);
            Ok(Arc::new(StaticInventory::from_file(path)?))
        }
        _ => {
            warn!(
                "{} not set; the reachability sweep has no devices",
                INVENTORY_ENV_VAR
            );
            Ok(Arc::new(StaticInventory::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = EngineSettings::from_env();
    let engine = Engine::new(settings, load_inventory()?);
    engine.start();

    let port: u16 = std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting device operations server on {}", addr);

    let app = Route::new()
        .at("/ws", get(events))
        .at("/health", get(health))
        .data(engine.clone())
        .with(Tracing);

    Server::new(TcpListener::bind(addr))
        .name("dcops")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            Some(SHUTDOWN_GRACE),
        )
        .await?;

    engine.shutdown().await;
    Ok(())
}
