use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kube_sd::{client, config::SdConfig, discovery::Discovery, metrics::Metrics};
use log::{error, info};
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(version, author = "Lach")]
struct Opts {
	/// Discovery configuration in YAML
	#[arg(long)]
	config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let opts = Opts::parse();
	let config = SdConfig::load(&opts.config)
		.with_context(|| format!("loading {}", opts.config.display()))?;
	let (client, own_namespace) = client::connect(&config)
		.await
		.context("connecting to the cluster")?;

	let registry = Registry::new();
	let metrics = Metrics::new(&registry).context("registering metrics")?;
	let discovery = Discovery::new(client, config, own_namespace.as_deref(), metrics);

	let token = CancellationToken::new();
	tokio::spawn({
		let token = token.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				error!("cannot listen for ctrl-c: {}", e);
			}
			info!("shutting down");
			token.cancel();
		}
	});

	let (tx, mut rx) = mpsc::channel(64);
	let running = tokio::spawn(discovery.run(token, tx));
	while let Some(groups) = rx.recv().await {
		for group in groups {
			println!("{}", serde_json::to_string(&group)?);
		}
	}
	running.await.context("discovery task")?;
	Ok(())
}
