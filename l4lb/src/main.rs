use anyhow::Context;
use clap::Parser;
use l4lb::{provision, Config, LoadBalancer, SharedTables};
use log::{debug, info};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Debug, Parser)]
struct Opt {
    #[clap(short, long)]
    config: String,
    /// Validate and apply the config, then exit.
    #[clap(long)]
    check: bool,
    /// Seconds between counter dumps; 0 disables them.
    #[clap(long, default_value_t = 0)]
    stats_interval: u64,
}

fn load_config(opt: &Opt) -> Result<Config, anyhow::Error> {
    let mut config_file = File::open(&opt.config)?;
    let mut config_contents = String::new();
    config_file.read_to_string(&mut config_contents)?;
    let config = Config::from_yaml(&config_contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let opt = Opt::parse();

    let config = load_config(&opt).context("failed to load config")?;

    let tables = Arc::new(SharedTables::new());
    let mut lb = LoadBalancer::new(config.lb.clone(), tables.clone())
        .context("invalid load balancer settings")?;
    provision(&mut lb, &config).context("failed to apply config")?;

    info!(
        "serving {} vips over {} reals, tables generation {}",
        lb.get_all_vips().len(),
        lb.reals().count(),
        tables.generation()
    );
    for key in lb.get_all_vips() {
        debug!("vip {}: {:?}", key, lb.get_reals_for_vip(&key)?);
    }
    if opt.check {
        return Ok(());
    }

    if opt.stats_interval > 0 {
        let counters = lb.counters();
        let period = Duration::from_secs(opt.stats_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for (kind, value) in counters.all() {
                    if value > 0 {
                        info!("{:?}: {}", kind, value);
                    }
                }
            }
        });
    }

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    Ok(())
}
