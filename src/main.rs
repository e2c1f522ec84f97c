use anyhow::Context;
use clap::Parser;
use pg_stream::{Config, Consumer, Error, Message, SlotOffset};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-stream")]
#[command(about = "Stream wal2json change sets from PostgreSQL replication slots", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, value_name = "NAME[@OFFSET]", help = "Slot to subscribe (repeatable)")]
    slot: Vec<SlotOffset>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-stream");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    info!("Configuration loaded successfully");

    let mut slots = config.slot_offsets()?;
    slots.extend(args.slot);
    if slots.is_empty() {
        anyhow::bail!("no slots to subscribe; set `slots` in the configuration or pass --slot");
    }

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        output_plugin = %config.replication.output_plugin,
        auto_ack = config.replication.auto_ack,
        slots = ?slots.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Configuration summary"
    );

    let consumer = Consumer::builder(config)
        .auto_ack(false)
        .message_handler(print_change_set)
        .error_handler(|err: &Error| {
            warn!(error = %err, "Replication error");
            matches!(err, Error::Serialization(_) | Error::Decode { .. })
        })
        .build();

    consumer
        .subscribe(slots)
        .await
        .context("failed to subscribe to replication slots")?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    consumer.close().await;

    info!("pg-stream stopped");
    Ok(())
}

/// Writes the message's change set to stdout as one JSON line, then acknowledges it.
async fn print_change_set(message: Message) -> pg_stream::Result<()> {
    let change_set = match message.change_set() {
        Ok(change_set) => change_set,
        Err(e) => {
            error!(slot = message.slot(), lsn = %message.lsn(), error = %e, "Undecodable payload");
            return Err(e);
        }
    };

    let line = serde_json::json!({
        "slot": message.slot(),
        "lsn": message.lsn().to_string(),
        "wal_start": message.wal_start().to_string(),
        "server_time": message.server_time(),
        "change_set": change_set,
    });

    {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, &line)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }

    message.ack().await
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_stream=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_stream=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
