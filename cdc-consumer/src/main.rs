use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdc_consumer::config::{Args, FailureMode};
use cdc_consumer::{CdcConsumer, KafkaDeadLetterSink, MongoDocumentStore, PgEnricher, Pipeline, ProcessStats};
use clap::Parser;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use shared::telemetry::init_tracing;
use shared::Decoder;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        topic = %args.topic,
        group_id = %args.group_id,
        workers = args.workers,
        "Starting cdc-consumer"
    );

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = Pool::builder()
        .max_size(args.db_pool_size)
        .connection_timeout(Duration::from_secs(args.db_timeout_secs))
        .build(config)
        .await
        .context("Failed to build system-of-record connection pool")?;

    let enricher = PgEnricher::new(pool);
    enricher
        .ping()
        .await
        .context("System of record is unreachable")?;
    info!("Connected to system of record");

    let store = MongoDocumentStore::connect(&args.mongodb_uri, &args.mongodb_database, &args.mongodb_collection)
        .await
        .context("Failed to connect to document store")?;
    info!(
        database = %args.mongodb_database,
        collection = %args.mongodb_collection,
        "Connected to document store"
    );

    let mut pipeline = Pipeline::new(Decoder::new(args.decimal_encoding()), Arc::new(enricher), Arc::new(store))
        .with_mode(args.enrichment_mode)
        .with_failure_policy(args.failure_policy());

    if args.failure_policy == FailureMode::DeadLetter {
        let sink = KafkaDeadLetterSink::new(&args.kafka_brokers, args.dead_letter_topic.clone())
            .context("Failed to create dead-letter producer")?;
        pipeline = pipeline.with_dead_letters(Arc::new(sink));
        info!(topic = %args.dead_letter_topic, "Dead-lettering failed records");
    }

    let pipeline = Arc::new(pipeline);
    let settings = args.kafka_settings();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    for worker in 0..args.workers.max(1) {
        let consumer = CdcConsumer::connect(&settings, pipeline.clone(), worker)
            .context("Failed to subscribe to change stream")?;
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }

    info!("cdc-consumer ready");

    shutdown_signal().await;
    info!("Shutdown requested, finishing in-flight records");
    let _ = shutdown_tx.send(true);

    let mut totals = ProcessStats::default();
    for handle in workers {
        match handle.await {
            Ok(stats) => totals.merge(&stats),
            Err(e) => error!("Consumer worker failed: {}", e),
        }
    }

    info!(
        upserted = totals.upserted,
        deleted = totals.deleted,
        skipped = totals.skipped,
        tombstones = totals.tombstones,
        failed = totals.failed,
        "cdc-consumer stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
