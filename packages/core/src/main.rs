use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gas_price_estimator::{
    config::Config,
    error::AppError,
    gasprice::{
        Estimator, GasPriceError, HeadTracker, MinimumSampler, PollingTracker, ProviderError,
        SubscribedTracker,
    },
    handler::{self, AppState},
    services,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Config::parse()).await {
        error!(%err, "gas price estimator failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let provider = services::connect(&config.provider, config.fetch_timeout())
        .await
        .map_err(|e| AppError::Config(format!("could not create provider: {e}")))?;
    info!(provider = provider.provider_name(), url = %config.provider, "connect to chain");

    let tracker: Arc<dyn HeadTracker> =
        match SubscribedTracker::connect(provider.clone(), config.fetch_timeout(), shutdown.clone()).await {
            Ok(tracker) => tracker as Arc<dyn HeadTracker>,
            Err(GasPriceError::Upstream(ProviderError::SubscriptionsUnsupported)) => {
                info!("provider cannot push new heads, falling back to polling");
                PollingTracker::spawn(
                    provider.clone(),
                    config.poll_interval(),
                    config.fetch_timeout(),
                    shutdown.clone(),
                )
            }
            Err(err) => return Err(err.into()),
        };

    let sampler = Arc::new(MinimumSampler::new(
        provider,
        config.sample_size,
        config.min_fee,
        config.cache_capacity()?,
        config.fetch_timeout(),
    ));

    let estimator = Arc::new(Estimator::new(tracker, sampler, config.estimator())?);
    let listener_task = estimator.listen(shutdown.clone());

    let app = handler::router(AppState {
        estimator,
        names: config.names.iter().cloned().collect(),
        request_timeout: config.request_timeout(),
        shutdown: shutdown.clone(),
    });

    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|e| AppError::Server(format!("could not bind {}: {e}", config.addr)))?;
    info!(addr = %config.addr, "start server");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
            signal.cancel();
        })
        .await
        .map_err(|e| AppError::Server(e.to_string()))?;

    shutdown.cancel();
    if let Err(e) = listener_task.await {
        warn!(error = %e, "estimator listener ended abnormally");
    }
    info!("server stopped");
    Ok(())
}
