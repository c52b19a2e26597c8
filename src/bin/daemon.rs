use autotss::*;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Periodically save SHSH blobs for every registered device
#[derive(Parser)]
#[clap(name = "autotss-daemon", version)]
struct Opts {
    /// JSON configuration file
    #[clap(long, env = "AUTOTSS_CONFIG")]
    config: Option<PathBuf>,
    /// Log filter, such as `info` or `autotss=debug`
    #[clap(long, default_value = "info")]
    loglevel: String,
}

async fn daemon(opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(opts.config.as_deref())?;
    let services = Services::open(&config)?;

    let (ready_tx, ready_rx) = watch::channel(false);
    let shutdown = Arc::new(Notify::new());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("interrupted, stopping after the current run");
                    shutdown.notify_one();
                }
                Err(err) => log::error!("failed to listen for interrupt: {}", err),
            }
        });
    }

    check_tool(services.tsschecker.program()).await?;
    log::info!("using {}", services.tsschecker.program().display());
    // Stores the value even without receivers, so there is no error to drop.
    ready_tx.send_replace(true);

    schedule::run(&services.saver, config.save_interval(), ready_rx, &shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    env_logger::Builder::new().parse_filters(&opts.loglevel).init();

    if let Err(err) = daemon(opts).await {
        eprintln!("autotss-daemon: {:#}", err);
        process::exit(1);
    }
}
