use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::broadcast::error::RecvError;
use uplink_client_core::bootstrap;
use uplink_client_core::client::Client;
use uplink_client_core::config::ClientConfig;
use uplink_client_core::metrics;
use uplink_client_core::runtime;
use uplink_client_core::transport::Transports;
use uplink_client_core::transport::websocket::config::WebSocketConfigBuilder;
use uplink_client_core::tree::RecordingTree;
use uplink_proto::Invocation;

use crate::cli::{Cli, Command, RunArgs};

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.overrides.apply(&mut config);
    config.validate()?;

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run(args) => connect(config, args).await,
    }
}

async fn connect(mut config: ClientConfig, args: RunArgs) -> Result<()> {
    let invocations = args
        .invocations
        .iter()
        .map(|raw| {
            serde_json::from_str::<Invocation>(raw)
                .with_context(|| format!("invocation is not a JSON object: {raw}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let websocket = WebSocketConfigBuilder::new()
        .connect_timeout(Duration::from_secs(args.connect_timeout))
        .build();
    let transports = Transports::network(websocket)?;
    let initial = if args.skip_init {
        None
    } else {
        bootstrap::fetch_initial(transports.requests.as_ref(), &mut config).await?
    };

    let client = Client::new(config, Box::new(RecordingTree::new()))?;
    let (handle, task) = runtime::spawn(client, transports, initial);
    let mut events = handle.subscribe();

    if !invocations.is_empty() {
        for invocation in invocations {
            handle.invoke(invocation)?;
        }
        handle.flush()?;
    }

    let stop_after = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(stop_after);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "uplink::cli", skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "uplink::cli", "interrupted, shutting down");
                let _ = handle.shutdown();
                break;
            }
            _ = &mut stop_after => {
                let _ = handle.shutdown();
                break;
            }
        }
    }

    task.await.map_err(|err| anyhow!("driver task failed: {err}"))?;
    if args.metrics {
        print!("{}", metrics::render());
    }
    Ok(())
}
