//! came-connect-bridge - CAME Connect gate client
//!
//! Keeps one gate's status current and logs every published change.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use came_connect_bridge::{Config, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "came_connect_bridge=info".into()),
        )
        .init();

    tracing::info!("Starting came-connect-bridge...");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        "Configuration loaded (device {}, policy {:?})",
        config.device.device_id,
        config.polling.refresh_policy
    );

    let session = Session::start(&config).await?;

    // Log snapshot changes until shutdown
    let mut updates = session.subscribe();
    let watcher = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let current = updates.borrow_and_update().clone();
            if let Some(snapshot) = current {
                tracing::info!(
                    "Gate {}: {} at {}%",
                    snapshot.phase_code(),
                    snapshot.phase_label().unwrap_or("unknown"),
                    snapshot.position()
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    session.shutdown().await;
    watcher.abort();

    Ok(())
}
