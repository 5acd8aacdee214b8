use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uplink_client_core::config::ClientConfig;
use uplink_client_core::telemetry::logging::{LogConfig, LogLevel};
use uplink_client_core::transport::TransportKind;

#[derive(Parser, Debug)]
#[command(
    name = "uplink",
    about = "Headless client for server-driven UIs speaking UIDL",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "UPLINK_CONFIG",
        value_name = "PATH",
        help = "TOML file with client settings"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and print client events as JSON lines (default)
    Run(RunArgs),
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, help = "Skip the init request and start without an initial message")]
    pub skip_init: bool,

    #[arg(
        long = "invoke",
        value_name = "JSON",
        help = "Invocation to send once connected; repeat for a batch"
    )]
    pub invocations: Vec<String>,

    #[arg(long, value_name = "SECS", help = "Disconnect after this many seconds")]
    pub duration: Option<u64>,

    #[arg(long, value_name = "SECS", default_value_t = 10, help = "Websocket connect timeout")]
    pub connect_timeout: u64,

    #[arg(long, help = "Dump prometheus metrics on exit")]
    pub metrics: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            skip_init: false,
            invocations: Vec::new(),
            duration: None,
            connect_timeout: 10,
            metrics: false,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    #[arg(long, global = true, value_name = "URL", help = "Service URL every request is derived from")]
    pub service_url: Option<String>,

    #[arg(long, global = true, value_name = "ID")]
    pub ui_id: Option<u32>,

    #[arg(long, global = true, help = "Open a push connection after start")]
    pub push: bool,

    #[arg(long, global = true, value_name = "TRANSPORT", help = "websocket or long-polling")]
    pub push_transport: Option<TransportKind>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.service_url {
            config.service_url = url.clone();
        }
        if let Some(ui_id) = self.ui_id {
            config.ui_id = ui_id;
        }
        if self.push {
            config.push_enabled = true;
        }
        if let Some(transport) = self.push_transport {
            config.push.transport = transport;
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "UPLINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "UPLINK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_config() {
        let cli = Cli::parse_from([
            "uplink",
            "--service-url",
            "http://example.com/app/",
            "--push",
            "--push-transport",
            "long-polling",
            "run",
            "--invoke",
            r#"{"node":1}"#,
        ]);
        let mut config = ClientConfig::default();
        cli.overrides.apply(&mut config);
        assert_eq!(config.service_url, "http://example.com/app/");
        assert!(config.push_enabled);
        assert_eq!(config.push.transport, TransportKind::LongPolling);
        match cli.command {
            Some(Command::Run(args)) => assert_eq!(args.invocations.len(), 1),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
