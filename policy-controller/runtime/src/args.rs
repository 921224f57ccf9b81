use crate::{
    core::{
        memory::{MemoryChains, MemoryPlatform},
        IpNet,
    },
    log::{self, LogFormat},
    mapping::{Config, Driver, DriverMetrics},
    replay::{Replay, Summary},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{self, AsyncBufRead, AsyncWriteExt, BufReader};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "grouppolicy",
    about = "Maps group-policy objects onto network primitives"
)]
pub struct Args {
    #[clap(long, default_value = "grouppolicy=info,warn", env = "GROUPPOLICY_LOG")]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    /// A file of JSON-lines lifecycle events, or `-` for stdin.
    #[clap(long, default_value = "-")]
    events: PathBuf,

    /// The address pool of L3 policies created on a tenant's behalf.
    #[clap(long, default_value = "10.0.0.0/8")]
    default_ip_pool: IpNet,

    #[clap(long, default_value = "24")]
    default_subnet_prefix_length: u8,

    #[clap(long, default_value = "default")]
    default_l3_policy_name: String,

    #[clap(long, default_value = "default")]
    default_external_segment_name: String,

    /// Prints the driver's metrics to stdout after the replay completes.
    #[clap(long)]
    print_metrics: bool,

    /// Stops at the first event that fails.
    #[clap(long)]
    fail_fast: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let config = self.driver_config()?;
        let Self {
            log_level,
            log_format,
            events,
            print_metrics,
            fail_fast,
            ..
        } = self;

        log::init(&log_level, log_format)?;

        let mut prom = <Registry>::default();
        let metrics = DriverMetrics::register(prom.sub_registry_with_prefix("grouppolicy"));
        let driver = Arc::new(Driver::new(
            config,
            Arc::new(MemoryPlatform::new()),
            Arc::new(MemoryChains::new()),
            metrics,
        ));

        let input = open(&events).await?;
        let replay = Replay::new(driver).with_fail_fast(fail_fast);
        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_err() {
                // Without a signal handler, replay runs to the end of the input.
                std::future::pending::<()>().await;
            }
        };
        let summary = replay.run(input, io::stdout(), shutdown).await?;
        let Summary {
            applied,
            rejected,
            failed,
            interrupted,
        } = summary;
        info!(applied, rejected, failed, interrupted, "Replay complete");

        if print_metrics {
            let mut text = String::new();
            encode(&mut text, &prom).context("failed to encode metrics")?;
            io::stdout()
                .write_all(text.as_bytes())
                .await
                .context("failed to write metrics")?;
        }

        if fail_fast && summary.errors() > 0 {
            bail!("replay stopped after a failed event");
        }
        Ok(())
    }

    fn driver_config(&self) -> Result<Config> {
        let config = Config {
            default_ip_pool: self.default_ip_pool,
            default_subnet_prefix_length: self.default_subnet_prefix_length,
            default_l3_policy_name: self.default_l3_policy_name.clone(),
            default_external_segment_name: self.default_external_segment_name.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

async fn open(path: &Path) -> Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}
