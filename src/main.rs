use anyhow::Result;
use clap::Parser;
use signup_mailer::broker::streams::StreamSourceConfig;
use signup_mailer::broker::{RedisProducer, RedisStreamSource};
use signup_mailer::config;
use signup_mailer::consumer::{ConfirmationHandler, ConsumerSettings, DeliveryConsumer};
use signup_mailer::db::{self, OutboxStore};
use signup_mailer::mailer::MailgunClient;
use signup_mailer::relay::OutboxRelay;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Confirmation mail delivery worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Skip the stale `processing` relay sweep
    #[arg(long)]
    no_relay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database.url).await?;
    db::run_migrations(&pool).await?;
    let store = OutboxStore::new(pool);

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();

    let relay_handle = if args.no_relay {
        None
    } else {
        let producer = Arc::new(RedisProducer::new(&cfg.broker.url)?);
        let relay = OutboxRelay::new(store.clone(), producer, cfg.broker.topic.clone(), &cfg.relay);
        let interval = Duration::from_millis(cfg.relay.interval_ms);
        Some(tokio::spawn(relay.run(interval, shutdown.clone())))
    };

    let provider = Arc::new(MailgunClient::from_config(&cfg.mail)?);
    let source = RedisStreamSource::connect(StreamSourceConfig::from_broker(&cfg.broker)).await?;
    let handler = ConfirmationHandler::new(store, provider, &cfg.mail, abort.clone());
    let consumer = DeliveryConsumer::new(
        Arc::new(source),
        handler,
        ConsumerSettings::from_broker(&cfg.broker),
    );

    // first SIGINT drains, second aborts in-flight sends
    let signals = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received; stopping intake");
        signals.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; aborting in-flight sends");
            abort.cancel();
        }
    });

    info!(topic = %cfg.broker.topic, channel = %cfg.broker.channel, "starting delivery consumer");
    if let Err(err) = consumer.run(shutdown.clone()).await {
        error!(?err, "consumer exited with error");
        shutdown.cancel();
        return Err(err);
    }

    if let Some(handle) = relay_handle {
        let _ = handle.await;
    }
    Ok(())
}
