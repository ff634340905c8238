//! The `kafka-cli` command line.
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use crate::{
    build_info::{DEFAULT_CLIENT_ID, VERSION},
    client::{Client, ClientBuilder},
    connection::ConnectionConfig,
    messenger::MessengerConfig,
};

use self::{config::Settings, format::OutputTemplate};

pub mod config;
mod consume;
pub mod format;
pub mod logging;
mod produce;
mod topics;

pub use self::{consume::ConsumeArgs, produce::ProduceArgs};

/// kafka-cli is a console util tool to access kafka cluster
#[derive(Debug, Parser)]
#[command(name = "kafka-cli", version = VERSION)]
pub struct Cli {
    /// config file (default is $HOME/.kafka-cli.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// broker list, delimited by comma
    #[arg(long, global = true, default_value = "127.0.0.1:9092", value_delimiter = ',')]
    pub brokers: Vec<String>,

    /// a user-provided string sent with every request to the brokers for logging, debugging, and auditing purposes
    #[arg(long = "clientid", global = true, default_value = DEFAULT_CLIENT_ID)]
    pub client_id: String,

    /// timeout of dialing to brokers
    #[arg(long = "net.dialtimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub dial_timeout: Duration,

    /// timeout of reading messages
    #[arg(long = "net.readtimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// timeout of writing messages
    #[arg(long = "net.writetimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub write_timeout: Duration,

    /// how many outstanding requests a connection is allowed to have before sending on it blocks
    #[arg(long = "net.maxopenrequests", global = true, default_value_t = 5)]
    pub max_open_requests: usize,

    /// internal channel buffer size
    #[arg(long = "buffersize", global = true, default_value_t = 256)]
    pub buffer_size: usize,

    /// metadata refresh frequency
    #[arg(long = "metadata.refresh", global = true, default_value = "10m", value_parser = humantime::parse_duration)]
    pub metadata_refresh: Duration,

    /// total number to request metadata when the cluster has a leader election
    #[arg(long = "metadata.retry.max", global = true, default_value_t = 3)]
    pub metadata_retry_max: usize,

    /// backoff between retrying
    #[arg(long = "metadata.retry.backoff", global = true, default_value = "250ms", value_parser = humantime::parse_duration)]
    pub metadata_retry_backoff: Duration,

    /// connect with TLS, trusting the certificates in --tls.ca
    #[arg(long, global = true, requires = "tls_ca")]
    pub tls: bool,

    /// PEM file with the CA certificates to trust
    #[arg(long = "tls.ca", global = true)]
    pub tls_ca: Option<PathBuf>,

    /// print log messages
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// log authentication messages
    #[arg(long = "log-auth-msg", global = true)]
    pub log_auth_msg: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// consume topic from kafka
    Consume(ConsumeArgs),

    /// produce message
    Produce(ProduceArgs),

    /// list topics and their partition count
    Topics,
}

impl Cli {
    /// Run the selected command.
    ///
    /// Errors are left to the caller to report, an `Ok` exit code might still signal failure.
    pub async fn run(self) -> Result<ExitCode> {
        let loaded = Settings::load(self.config.as_deref())?;
        if let Some(path) = &loaded.path {
            eprintln!("Using config file: {}", path.display());
        }
        let settings = loaded.settings;
        let client_id = settings.client_id(&self.client_id);

        if self.log_auth_msg {
            println!(
                "AuthLog: User: {}, Password: {}, ClientID: {}",
                settings.user, settings.password, client_id
            );
        }

        // reject bad flags before talking to the cluster
        let template = match &self.command {
            Command::Consume(args) => args.template()?,
            Command::Produce(_) | Command::Topics => OutputTemplate::default(),
        };

        let client = Arc::new(self.connect(&settings, client_id).await?);

        match self.command {
            Command::Consume(args) => consume::run(client, args, template, self.buffer_size).await,
            Command::Produce(args) => produce::run(client, args).await,
            Command::Topics => topics::run(&client).await,
        }
    }

    async fn connect(&self, settings: &Settings, client_id: String) -> Result<Client> {
        debug!(brokers=?self.brokers, client_id = client_id.as_str(), "Connecting");

        let mut builder = ClientBuilder::new(self.brokers.clone())
            .client_id(client_id)
            .connection_config(ConnectionConfig {
                dial_timeout: self.dial_timeout,
                messenger: MessengerConfig {
                    max_open_requests: self.max_open_requests,
                    read_timeout: self.read_timeout,
                    write_timeout: self.write_timeout,
                },
            })
            .metadata_refresh(self.metadata_refresh)
            .metadata_retry(self.metadata_retry_max, self.metadata_retry_backoff);

        if let Some(sasl_config) = settings.sasl_config() {
            builder = builder.sasl_config(sasl_config);
        }

        if self.tls {
            builder = self.with_tls(builder)?;
        }

        builder
            .build()
            .await
            .with_context(|| format!("cannot connect to {}", self.brokers.join(",")))
    }

    #[cfg(feature = "transport-tls")]
    fn with_tls(&self, builder: ClientBuilder) -> Result<ClientBuilder> {
        let path = self
            .tls_ca
            .as_ref()
            .context("--tls requires --tls.ca")?;
        let pem = std::fs::read(path)
            .with_context(|| format!("cannot read CA file {}", path.display()))?;
        let tls_config = crate::connection::tls_config_from_pem(&pem)
            .with_context(|| format!("invalid CA file {}", path.display()))?;

        Ok(builder.tls_config(tls_config))
    }

    #[cfg(not(feature = "transport-tls"))]
    fn with_tls(&self, _builder: ClientBuilder) -> Result<ClientBuilder> {
        anyhow::bail!("this build has no TLS support")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["kafka-cli", "topics"]).unwrap();

        assert_eq!(cli.brokers, vec!["127.0.0.1:9092"]);
        assert_eq!(cli.client_id, "kafka-cli");
        assert_eq!(cli.dial_timeout, Duration::from_secs(30));
        assert_eq!(cli.read_timeout, Duration::from_secs(30));
        assert_eq!(cli.write_timeout, Duration::from_secs(30));
        assert_eq!(cli.max_open_requests, 5);
        assert_eq!(cli.buffer_size, 256);
        assert_eq!(cli.metadata_refresh, Duration::from_secs(600));
        assert_eq!(cli.metadata_retry_max, 3);
        assert_eq!(cli.metadata_retry_backoff, Duration::from_millis(250));
        assert!(!cli.tls);
        assert!(!cli.verbose);
        assert_matches!(cli.command, Command::Topics);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kafka-cli",
            "--brokers=a:9092,b:9092",
            "topics",
            "--net.dialtimeout",
            "1s",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(cli.dial_timeout, Duration::from_secs(1));
        assert!(cli.verbose);
    }

    #[test]
    fn tls_needs_ca() {
        assert!(Cli::try_parse_from(["kafka-cli", "--tls", "topics"]).is_err());

        let cli =
            Cli::try_parse_from(["kafka-cli", "--tls", "--tls.ca", "ca.pem", "topics"]).unwrap();
        assert!(cli.tls);
        assert_eq!(cli.tls_ca, Some(PathBuf::from("ca.pem")));
    }

    #[test]
    fn bad_duration() {
        assert!(Cli::try_parse_from(["kafka-cli", "--metadata.refresh", "soon", "topics"]).is_err());
    }

    #[tokio::test]
    async fn unknown_format_variable_fails_before_connecting() {
        let config = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(config.path(), "client_id: test\n").unwrap();
        let config_arg = format!("--config={}", config.path().display());

        let cli = Cli::try_parse_from([
            "kafka-cli",
            // nothing listens here
            "--brokers=127.0.0.1:1",
            config_arg.as_str(),
            "consume",
            "--format={{.Nope}}",
            "foo",
        ])
        .unwrap();

        let err = cli.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("unknown variable"), "{err:#}");
    }

    #[tokio::test]
    async fn missing_config_file() {
        let cli = Cli::try_parse_from([
            "kafka-cli",
            "--config=/nonexistent/kafka-cli.yaml",
            "topics",
        ])
        .unwrap();

        let err = cli.run().await.unwrap_err();
        assert!(err.to_string().contains("config file"), "{err}");
    }
}
