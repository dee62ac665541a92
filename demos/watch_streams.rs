//! Example: watch several SSE streams through one hub
//!
//! This example registers two SSE endpoints, then prints connection status
//! changes and the newest matching event every time the store changes.
//!
//! Run with: cargo run --example watch_streams -- http://localhost:3000/events
//!
//! Pass one or more SSE URLs; each one becomes a connection named `stream-N`.
//! Set `RUST_LOG=rust_sse_hub=debug` to see connection logs.

use rust_sse_hub::{
    ConnectionCallbacks, ConnectionDescriptor, CredentialError, HttpTransport, IdentityProvider,
    Selection, SseHub, SseRetry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rust_sse_hub=info")),
        )
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        eprintln!("usage: watch_streams <sse-url>...");
        return;
    }

    let callbacks = ConnectionCallbacks::new()
        .on_open(|id| println!("[{id}] open"))
        .on_error(|err| println!("[{}] error: {err}", err.connection_id()));

    let hub = SseHub::builder()
        .identity(IdentityProvider::in_memory())
        .transport(
            HttpTransport::new()
                .retry(SseRetry::with_exponential_backoff(Duration::from_millis(500)).max_retries(5)),
        )
        .callbacks(callbacks)
        .build();

    println!("Client identity: {}", hub.identity().get());

    hub.register(urls.iter().enumerate().map(|(i, url)| {
        ConnectionDescriptor::new(format!("stream-{i}"), url.clone(), || async {
            // Pretend to fetch a fresh token from a session service
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, CredentialError>("demo-token".to_string())
        })
    }));

    let query = hub.query();
    let mut changes = hub.store().changes();
    let mut last_seen = None;

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                hub.shutdown();
                break;
            }
        }

        let statuses = query.connection_statuses(None);
        let mut ids: Vec<&String> = statuses.keys().collect();
        ids.sort();
        for id in ids {
            let state = &statuses[id];
            println!("  {id}: {}", state.status);
        }

        if let Some(event) = query.latest_since_mount(Selection::Any, Selection::Any) {
            if !last_seen.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &event)) {
                println!(
                    "  latest [{}] {}: {}",
                    event.connection_id, event.event_type, event.raw
                );
                last_seen = Some(event);
            }
        }
    }
}
