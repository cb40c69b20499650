use std::io::Write;

use anyhow::Result;
use clap::Parser;

use reqshield_appsec::AppsecConfig;
use reqshield_core::config::ReqshieldConfig;
use reqshield_daemon::cli::DaemonCli;
use reqshield_daemon::logging;
use reqshield_daemon::orchestrator::{self, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = ReqshieldConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;

    // CLI flags take precedence over file and environment.
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }

    if cli.validate {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        let engine = orchestrator::load_engine(&AppsecConfig::from_core(&config)).await?;
        println!("configuration valid ({} rules loaded)", engine.rule_count());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "reqshield-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config).await?;

    match cli.replay {
        Some(path) => {
            orchestrator.start()?;
            let result = orchestrator.replay(&path).await;
            orchestrator.shutdown().await;

            let mut stdout = std::io::stdout().lock();
            for outcome in result? {
                serde_json::to_writer(&mut stdout, &outcome)?;
                writeln!(stdout)?;
            }
            Ok(())
        }
        None => orchestrator.run().await,
    }
}
