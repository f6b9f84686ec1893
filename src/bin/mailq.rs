//! mailq CLI: operator interface to the mail pipeline.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use mailq::balancer::{RunOutcome, SendBalancer, SortBalancer};
use mailq::config::Config;
use mailq::db::Db;
use mailq::host::local_host_name;
use mailq::model::{HostStatus, Stage};
use mailq::store::{CampaignStore, HostStore, SendStore, SortStore};
use mailq::telemetry::{TelemetryConfig, init_telemetry};
use mailq::transport::{TransportFactory, TransportKind};
use mailq::worker::{Fleet, WorkerSettings};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "mailq", about = "Bulk email sort and send pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Level pending work across the hosts of a stage
    Balance {
        /// sort or send
        stage: Stage,
    },
    /// Run this host's worker fleet for a stage
    Work {
        /// sort or send
        stage: Stage,
        /// Single slot and no real deliveries
        #[arg(long)]
        dev: bool,
        /// Override the configured number of slots
        #[arg(long)]
        processes: Option<u32>,
    },
    /// Show hosts and backlogs
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Host operations
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
}

#[derive(Subcommand)]
enum HostAction {
    /// Put a host back to available
    Clear { stage: Stage, name: String },
    /// Stop a host from receiving work; its fleet quits after the current batch
    Disable { stage: Stage, name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let db = Arc::new(db);

    match cli.command {
        Command::Balance { stage } => cmd_balance(db, &config, stage).await,
        Command::Work {
            stage,
            dev,
            processes,
        } => cmd_work(db, &config, stage, dev, processes).await,
        Command::Status { json } => cmd_status(&db, json).await,
        Command::Host { action } => cmd_host(&db, action).await,
    }
}

async fn cmd_balance(db: Arc<Db>, config: &Config, stage: Stage) -> anyhow::Result<()> {
    let host_name = local_host_name(config.host_name.as_deref())?;
    let batch = config.pipeline.max_batch_size;
    let outcome = match stage {
        Stage::Sort => SortBalancer::new(db, batch, host_name).run().await?,
        Stage::Send => SendBalancer::new(db, batch, host_name).run().await?,
    };
    match outcome {
        RunOutcome::Locked => println!("{stage} balancer already running"),
        RunOutcome::Completed(report) => {
            println!(
                "{stage}: reserved {} item(s) over {} round(s) to {} host(s)",
                report.reserved, report.rounds, report.hosts
            );
            for id in &report.finished_campaigns {
                println!("campaign {id} complete");
            }
        }
    }
    Ok(())
}

async fn cmd_work(
    db: Arc<Db>,
    config: &Config,
    stage: Stage,
    dev: bool,
    processes: Option<u32>,
) -> anyhow::Result<()> {
    let host_name = local_host_name(config.host_name.as_deref())?;
    let mut settings = WorkerSettings::from_pipeline(&config.pipeline);
    if let Some(n) = processes {
        anyhow::ensure!(n > 0, "--processes must be positive");
        settings.processes = n;
    }
    let transport: Arc<dyn TransportFactory> = if dev {
        settings.processes = 1;
        Arc::new(TransportKind::Noop)
    } else {
        Arc::new(TransportKind::Sendmail {
            program: config.pipeline.sendmail_program.clone(),
        })
    };

    let fleet = Fleet::new(
        db,
        stage,
        host_name,
        settings,
        config.links.clone(),
        transport,
    );
    let report = fleet.run().await?;
    if report.refused {
        println!("{}: host busy or blocked, not running", report.host);
        return Ok(());
    }
    println!(
        "{}: {} done, {} removed, {} retried, {} failed, {} zombie(s) in {} round(s)",
        report.host,
        report.items.done,
        report.items.removed,
        report.items.retried,
        report.items.failed,
        report.items.zombies,
        report.rounds
    );
    if report.stopped {
        println!("stopped early on request");
    }
    Ok(())
}

async fn cmd_status(db: &Db, json: bool) -> anyhow::Result<()> {
    let hosts = db.all_hosts().await?;
    let recipients = db.recipient_backlog().await?;
    let deliveries = db.delivery_backlog().await?;
    let drained = db.drained_campaigns().await?;

    if json {
        let value = serde_json::json!({
            "hosts": hosts,
            "recipients": recipients,
            "deliveries": deliveries,
            "drained_campaigns": drained,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{:<6}  {:<20}  {:<12}  DEPTH", "STAGE", "HOST", "STATUS");
    println!("{}", "-".repeat(50));
    for host in &hosts {
        println!(
            "{:<6}  {:<20}  {:<12}  {}",
            host.stage, host.name, host.status, host.queue_depth
        );
    }
    println!();
    println!(
        "recipients: {} pending, {} reserved, {} sorted",
        recipients.pending, recipients.reserved, recipients.finished
    );
    println!(
        "deliveries: {} pending, {} reserved, {} sent, {} failed",
        deliveries.pending, deliveries.reserved, deliveries.finished, deliveries.failed
    );
    if !drained.is_empty() {
        println!("{} campaign(s) awaiting cleanup", drained.len());
    }
    Ok(())
}

async fn cmd_host(db: &Db, action: HostAction) -> anyhow::Result<()> {
    let (stage, name) = match &action {
        HostAction::Clear { stage, name } | HostAction::Disable { stage, name } => (*stage, name),
    };
    let host = db
        .find_host(stage, name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no {stage} host named '{name}'"))?;
    match &action {
        HostAction::Clear { .. } => {
            db.clear_host(host.id).await?;
            println!("{stage} host {name}: available");
        }
        HostAction::Disable { .. } => {
            db.set_host_status(host.id, HostStatus::Disabled).await?;
            println!("{stage} host {name}: disabled");
        }
    }
    Ok(())
}
