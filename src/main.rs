use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kameo::Actor;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use canvas_notify::config::Config;
use canvas_notify::db;
use canvas_notify::events::EventRegistry;
use canvas_notify::gateway::{ConnectionRegistry, SessionGateway};
use canvas_notify::health::{HealthMonitorActor, HealthStatus, UpdateHealth};
use canvas_notify::messaging::{run_consumer, KafkaProducer};
use canvas_notify::metrics::{self, Metrics};
use canvas_notify::notifications::NotificationDispatcher;
use canvas_notify::relay::OutboxRelay;
use canvas_notify::router::{ClusterDelivery, MessageRouterServer, RouterClient, RouterService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,canvas_notify=debug")))
        .init();

    let config = Config::parse();
    let owner_node = config.owner_node();
    tracing::info!(node = %owner_node, "Starting canvas-notify");

    // === 1. Database ===
    let pool = db::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    // === 2. Metrics, registry, gateway ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("Metrics registry created with {} metrics", metrics.registry().gather().len());

    let registry = Arc::new(ConnectionRegistry::new(
        owner_node.clone(),
        config.outbound_queue_capacity,
        metrics.clone(),
    ));
    let gateway = SessionGateway::new(pool.clone(), registry.clone());
    gateway
        .reclaim_orphans()
        .await
        .context("Failed to reclaim connections left by a previous run")?;

    // === 3. Producer and health monitor ===
    let producer = Arc::new(KafkaProducer::new(&config.kafka_brokers)?);
    let health = HealthMonitorActor::spawn(
        HealthMonitorActor::new(Duration::from_secs(10))
            .with_broker(producer.circuit_breaker())
            .with_database(pool.clone())
            .with_metrics(metrics.clone()),
    );

    // Metrics HTTP server runs on its own actix system
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_health = health.clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_health, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // === 4. Router gRPC server ===
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<MessageRouterServer<RouterService>>()
        .await;

    let router = MessageRouterServer::new(RouterService::new(
        registry.clone(),
        config.rpc_timeout(),
        metrics.clone(),
    ));
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let mut grpc_shutdown = shutdown_rx.clone();
    let grpc = tokio::spawn(
        Server::builder()
            .add_service(health_service)
            .add_service(router)
            .serve_with_shutdown(grpc_addr, async move {
                let _ = grpc_shutdown.changed().await;
            }),
    );
    tracing::info!(addr = %grpc_addr, "Router listening");

    // === 5. Dispatcher ===
    let delivery = Arc::new(ClusterDelivery::new(
        pool.clone(),
        registry.clone(),
        RouterClient::new(config.rpc_timeout()),
    ));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        pool.clone(),
        EventRegistry::with_domain_events(),
        delivery,
        metrics.clone(),
    ));

    let consumer = {
        let health = health.clone();
        let settings = config.consumer_settings();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let _ = health
                .tell(UpdateHealth::new("consumer", HealthStatus::Healthy))
                .send()
                .await;
            let result = run_consumer(settings, dispatcher, shutdown).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Consumer stopped");
                let _ = health
                    .tell(UpdateHealth::new("consumer", HealthStatus::Unhealthy(e.to_string())))
                    .send()
                    .await;
            }
            result
        })
    };

    // === 6. Optional built-in relay ===
    let relay = if config.relay_enabled {
        Some(OutboxRelay::spawn(
            OutboxRelay::new(pool.clone(), producer.clone(), &config.event_namespace, metrics.clone())
                .with_batch_size(config.relay_batch_size)
                .with_poll_interval(Some(config.relay_poll_interval())),
        ))
    } else {
        tracing::info!("Built-in outbox relay disabled, expecting an external CDC connector");
        None
    };

    tracing::info!("canvas-notify ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(relay) = relay {
        let _ = relay.stop_gracefully().await;
    }

    match consumer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Consumer exited with error"),
        Err(e) => tracing::error!(error = %e, "Consumer task failed"),
    }
    match grpc.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Router server exited with error"),
        Err(e) => tracing::error!(error = %e, "Router server task failed"),
    }

    pool.close().await;
    tracing::info!("canvas-notify stopped");
    Ok(())
}
