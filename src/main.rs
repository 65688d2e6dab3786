use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};

use sitegate::events::{EventFilter, EventKind, ShellEvent};
use sitegate::sites::types::{SiteRecord, SiteStatus};
use sitegate::tab::http::HttpTabOpener;
use sitegate::{AppState, GateConfig};

#[derive(Parser)]
#[command(name = "sitegate", about = "Navigation access control for the browser shell")]
struct Cli {
    /// Log at debug level.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decide whether a URL may load.
    Check { url: String },
    /// Add a site and wait for its verification.
    Add { label: String, url: String },
    /// Delete a site (by id or label).
    Delete { site: String },
    /// Re-run verification for a failed site.
    Retry { site: String },
    /// Hide a site from the list.
    Hide { site: String },
    /// Show a hidden site again.
    Unhide { site: String },
    /// Request a tab for a site.
    Open { site: String },
    /// List sites.
    List {
        /// Include hidden sites.
        #[arg(long)]
        all: bool,
    },
    /// Report whether a URL's site may be (re-)added.
    CanAdd { url: String },
    /// Show the delete history of removed sites.
    Restrictions,
}

fn print_site(site: &SiteRecord) {
    println!(
        "{}  {:<20} {:<30} {:<9}{}",
        site.id,
        site.label,
        site.host,
        site.status,
        if site.hidden { " (hidden)" } else { "" }
    );
}

fn resolve(app: &AppState, site: &str) -> anyhow::Result<SiteRecord> {
    app.sites
        .find(site)
        .ok_or_else(|| anyhow::anyhow!("no site with id or label '{}'", site))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    // Load env
    let _ = dotenv::dotenv();
    let config = GateConfig::from_env();

    let opener = Arc::new(HttpTabOpener::new(Duration::from_secs(20))?);
    let app = AppState::build(&config, opener).await?;

    app.bus
        .register_handler("cli-notices", EventFilter::only(&[EventKind::Notice]), |event| async move {
            if let ShellEvent::Notice { message, .. } = event {
                info!("{}", message);
            }
            Ok(())
        })
        .await;

    match cli.command {
        Command::Check { url } => {
            let verdict = if app.policy.is_allowed(&url) {
                "allowed"
            } else if app.policy.is_blocked(&url) {
                "blocked"
            } else {
                "denied"
            };
            println!("{}: {}", url, verdict);
        }
        Command::Add { label, url } => match app.sites.add_site(&label, &url).await {
            Ok(site) => {
                let mut directory = app.sites.directory();
                let status = loop {
                    match app.sites.site(&site.id).map(|s| s.status) {
                        Some(SiteStatus::Pending) => {}
                        Some(status) => break Some(status),
                        None => break None,
                    }
                    if !directory.changed().await {
                        break None;
                    }
                };
                match status {
                    Some(status) => println!("{} ({}): {}", site.label, site.host, status),
                    None => println!("{} was removed before verification finished", site.label),
                }
            }
            Err(e) => println!("Cannot add {}: {}", label, e),
        },
        Command::Delete { site } => {
            let site = resolve(&app, &site)?;
            app.sites.delete_site(&site.id).await;
            println!("Deleted {}", site.label);
            println!("{}", app.ledger.restriction_message(&site.host).await);
        }
        Command::Retry { site } => {
            let site = resolve(&app, &site)?;
            if app.sites.retry_site(&site.id).await {
                println!("Retrying {}", site.label);
            } else {
                println!("{} is already verified", site.label);
            }
        }
        Command::Hide { site } => {
            let site = resolve(&app, &site)?;
            app.sites.set_hidden(&site.id, true).await;
        }
        Command::Unhide { site } => {
            let site = resolve(&app, &site)?;
            app.sites.set_hidden(&site.id, false).await;
        }
        Command::Open { site } => {
            let site = resolve(&app, &site)?;
            if let Some(url) = app.sites.open_site(&site.id) {
                println!("{}", url);
            }
        }
        Command::List { all } => {
            let sites = if all {
                app.sites.get_all_sites_including_hidden()
            } else {
                app.sites.get_all_sites()
            };
            for site in &sites {
                print_site(site);
            }
            if sites.is_empty() {
                println!("No sites.");
            }
        }
        Command::CanAdd { url } => {
            let (ok, message) = app.sites.can_add_site_with_details(&url).await;
            if ok {
                println!("{} can be added", url);
            } else {
                println!("{}", message);
            }
        }
        Command::Restrictions => {
            for record in app.ledger.records().await {
                println!(
                    "{:<30} deleted {}x, last {}",
                    record.host_or_id,
                    record.delete_count,
                    record.last_deleted_at().format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    app.sites.shutdown().await;
    Ok(())
}
