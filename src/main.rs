use std::sync::Arc;

use ride_dispatch::api::DynAPI;
use ride_dispatch::clock::SystemClock;
use ride_dispatch::config::Config;
use ride_dispatch::db::PgPool;
use ride_dispatch::engine::Engine;
use ride_dispatch::error::Error;
use ride_dispatch::geo::PgGeoIndex;
use ride_dispatch::notifier::{LogNotifier, Notifier, WebhookNotifier};
use ride_dispatch::server::serve;
use ride_dispatch::store::PgRideStore;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let PgPool(pool) = PgPool::new(&config.database_url, config.max_connections).await?;

    let store = Arc::new(PgRideStore::new(pool.clone()).await?);
    let geo = Arc::new(PgGeoIndex::new(pool).await?);

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.as_str())),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let engine = Arc::new(
        Engine::new(
            config.dispatch.clone(),
            store,
            geo.clone(),
            notifier,
            Arc::new(SystemClock::new()),
        )
        .with_hook(geo),
    );

    engine.restore_schedule().await?;

    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
    let scheduler = engine.spawn_scheduler(shutdown_rx);

    let result = serve(engine as DynAPI, config.listen_addr).await;

    let _ = shutdown_tx.send(()).await;
    if let Err(err) = scheduler.await {
        tracing::error!(error = %err, "expiry scheduler panicked");
    }

    result
}
