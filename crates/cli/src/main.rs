mod fetch_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::{Subscriber, info},
    tracing_subscriber::{
        EnvFilter, Layer,
        fmt::{self, MakeWriter},
        layer::SubscriberExt,
        registry::LookupSpan,
        util::SubscriberInitExt,
    },
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard: resilient request gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Only look for switchboard.{toml,yaml,yml,json} in this directory.
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check whether the upstream reports healthy.
    Health {
        /// Overrides `upstream.base_url`.
        #[arg(long)]
        base_url: Option<String>,
    },
    /// GET one or more URLs in order and print each JSON response.
    Get {
        /// Absolute URLs, or paths resolved against `upstream.base_url`.
        #[arg(required = true)]
        urls: Vec<String>,
        #[command(flatten)]
        request: fetch_commands::RequestArgs,
        /// Cache decoded responses for this many milliseconds. Applies to
        /// URLs repeated within this invocation.
        #[arg(long)]
        cache_ttl_ms: Option<u64>,
    },
    /// POST a JSON body and print the JSON response.
    Post {
        /// Absolute URL, or a path resolved against `upstream.base_url`.
        url: String,
        #[command(flatten)]
        request: fetch_commands::RequestArgs,
        /// JSON request body.
        #[arg(long)]
        body: String,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // stdout carries command output only.
    tracing_subscriber::registry()
        .with(filter)
        .with(log_layer(cli.json_logs, std::io::stderr))
        .init();
}

fn log_layer<S, W>(json: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_ansi(true)
            .with_writer(writer)
            .boxed()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = cli.config_dir.clone() {
        switchboard_config::set_config_dir(dir);
    }
    let mut config = switchboard_config::discover_and_load();

    match cli.command {
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");
            switchboard_gateway::start_gateway(&config).await
        },
        Commands::Health { base_url } => {
            if base_url.is_some() {
                config.upstream.base_url = base_url;
            }
            if !fetch_commands::health(&config).await? {
                std::process::exit(1);
            }
            Ok(())
        },
        Commands::Get {
            urls,
            request,
            cache_ttl_ms,
        } => fetch_commands::get(&config, &urls, &request, cache_ttl_ms).await,
        Commands::Post { url, request, body } => {
            fetch_commands::post(&config, &url, &request, &body).await
        },
        Commands::Config => {
            print!("{}", switchboard_config::to_toml_string(&config)?);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        clap::CommandFactory,
        std::{
            io,
            sync::{Arc, Mutex},
        },
    };

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_logs_go_to_the_given_writer() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber =
            tracing_subscriber::registry().with(log_layer(true, move || sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            info!(url = "/api/items", "fetching");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["fields"]["message"], "fetching");
        assert_eq!(line["fields"]["url"], "/api/items");
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn get_flags_parse() {
        let cli = Cli::parse_from([
            "switchboard",
            "get",
            "/api/items",
            "/api/items",
            "--timeout-ms",
            "500",
            "--cache-ttl-ms",
            "1000",
        ]);
        let Commands::Get {
            urls,
            request,
            cache_ttl_ms,
        } = cli.command
        else {
            panic!("expected get");
        };
        assert_eq!(urls, ["/api/items", "/api/items"]);
        assert_eq!(request.timeout_ms, Some(500));
        assert_eq!(request.retries, None);
        assert_eq!(cache_ttl_ms, Some(1000));
    }
}
