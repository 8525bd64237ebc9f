use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Parser;
use signup_mailer::broker::RedisProducer;
use signup_mailer::config;
use signup_mailer::db::{self, OutboxStore, UserRepo};
use signup_mailer::model::NewAccount;
use signup_mailer::registration::RegistrationCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Register an account and queue its confirmation mail.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    email: String,

    /// Already-hashed password
    #[arg(long)]
    password_hash: String,

    #[arg(long)]
    name: String,

    /// Date of birth, YYYY-MM-DD
    #[arg(long)]
    date_of_birth: Option<NaiveDate>,
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

    let producer = Arc::new(RedisProducer::new(&cfg.broker.url)?);
    let coordinator = RegistrationCoordinator::new(
        UserRepo::new(pool.clone()),
        OutboxStore::new(pool),
        producer,
        cfg.broker.topic.clone(),
    );

    let account = NewAccount {
        email: args.email,
        password_hash: args.password_hash,
        display_name: args.name,
        date_of_birth: args.date_of_birth,
    };
    match coordinator.register(account).await {
        Ok(reg) => {
            info!(user_id = reg.user.id, outbox_id = reg.outbox.id, status = %reg.outbox.status, "registered");
            println!("{}\t{}\t{}", reg.user.id, reg.outbox.id, reg.outbox.status);
            Ok(())
        }
        Err(err) if err.account_committed() => {
            error!(%err, "account created without a queued confirmation mail");
            bail!("account created, confirmation mail pending: {err}")
        }
        Err(err) => {
            error!(%err, "registration failed");
            Err(err.into())
        }
    }
}
