//! ship-sync: headless sync client.
//!
//! Warms the cache, follows the event stream and prints every notification
//! until interrupted.

use ship_client::config::ShipConfig;
use ship_client::error::ClientError;
use ship_client::notifications::{Notification, NotificationAction, NotificationLevel};
use ship_client::prefetch;
use ship_client::ShipClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ShipConfig::load()?;
    init_logging()?;

    let (client, mut notifications) = ShipClient::new(config)?;
    let report = client.start().await?;
    tracing::info!(
        succeeded = report.warmup.succeeded,
        failed = report.warmup.failed.len(),
        "Warmup complete"
    );

    // Hold observers so invalidations refetch the warmed views.
    let authenticated = client.credentials().is_authenticated();
    let mut observers = Vec::new();
    for target in prefetch::targets(&client.config().prefetch, authenticated) {
        observers.push(client.cache().observe(target.key)?);
    }

    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                print_notification(&notification);
                // Headless: answer the reconnect prompt ourselves.
                if notification.action == Some(NotificationAction::Reconnect) {
                    client.reconnect().await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    drop(observers);
    client.shutdown().await;
    let stats = client.cache().stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        fetches = stats.fetches,
        invalidations = stats.invalidations,
        "Cache stats at exit"
    );
    Ok(())
}

fn init_logging() -> Result<(), ClientError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| ClientError::Logging(e.to_string()))
}

fn print_notification(notification: &Notification) {
    let tag = match notification.level {
        NotificationLevel::Info => "info",
        NotificationLevel::Warning => "warn",
        NotificationLevel::Error => "error",
        NotificationLevel::Success => "ok",
    };
    match &notification.description {
        Some(description) => println!("[{}] {} ({})", tag, notification.message, description),
        None => println!("[{}] {}", tag, notification.message),
    }
}
