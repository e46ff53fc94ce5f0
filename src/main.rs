mod cache;
mod config;
mod host;
mod http;
mod network;
mod proxy;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use host::{Host, Registration};
use http::{Header, Request};
use network::HttpNetwork;
use proxy::{CacheProxy, ResponseSource};

type Proxy = CacheProxy<HttpNetwork, SqliteStorage>;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Network-first offline cache for web app shells")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin that seed paths and relative targets resolve against
  #[arg(short, long)]
  origin: Option<Url>,

  /// Cache namespace (version) to use
  #[arg(long)]
  cache_name: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the current version: seed the cache and drop older namespaces
  Install,
  /// Fetch a resource network-first, falling back to the cache
  Fetch {
    /// Absolute URL or path relative to the origin
    target: String,

    /// HTTP method; only GET is served from the cache
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,

    /// Request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<Header>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// List cache namespaces
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  config.apply_overrides(args.origin, args.cache_name)?;

  let _guard = init_tracing(&config)?;

  let storage = Arc::new(match &config.cache_path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  });

  match args.command {
    Command::Install => install(&config, storage).await,
    Command::Fetch {
      target,
      method,
      headers,
      data,
    } => {
      let mut request = Request::new(method, config.resolve(&target)?);
      for header in headers {
        request = request.with_header(header);
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      fetch(&config, storage, request).await
    }
    Command::Caches => list_caches(&config, &storage),
  }
}

/// Parse a curl-style `Name: value` header.
fn parse_header(raw: &str) -> std::result::Result<Header, String> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| format!("expected 'Name: value', got '{}'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(format!("header name is empty in '{}'", raw));
  }
  Ok(Header::new(name, value.trim()))
}

/// Log to stderr, or to the configured file through a background writer.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellcache=info"));

  match &config.log.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

fn build_proxy(config: &Config, storage: Arc<SqliteStorage>) -> Result<(Proxy, Arc<HttpNetwork>)> {
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let proxy = CacheProxy::new(
    config.cache_name.clone(),
    config.seed_urls()?,
    Arc::clone(&network),
    storage,
  )
  .with_skip_waiting(config.activation.skip_waiting)
  .with_claim_clients(config.activation.claim_clients);

  Ok((proxy, network))
}

async fn install(config: &Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let (proxy, network) = build_proxy(config, storage)?;
  let mut host = Host::new(network);

  match host.register(proxy).await? {
    Registration::Activated { deleted } => {
      info!(namespace = %config.cache_name, "Installed");
      for name in deleted {
        println!("deleted {}", name);
      }
    }
    Registration::Waiting => {
      info!(namespace = %config.cache_name, "Installed, waiting to activate");
    }
  }

  Ok(())
}

async fn fetch(config: &Config, storage: Arc<SqliteStorage>, request: Request) -> Result<()> {
  let (proxy, network) = build_proxy(config, storage)?;
  let mut host = Host::new(network);
  host.resume(proxy);
  let client = host.open_client();

  let delivery = host.fetch(client, request).await?;

  let response = &delivery.response;
  let content_type = response.header("content-type").unwrap_or("unknown");
  match delivery.source {
    ResponseSource::Network => {
      info!(status = response.status, content_type, "Served from network")
    }
    ResponseSource::Offline { cached_at } => {
      info!(%cached_at, content_type, "Network unavailable, served from cache")
    }
  }

  let mut stdout = std::io::stdout();
  stdout
    .write_all(response.body())
    .and_then(|_| stdout.flush())
    .map_err(|e| eyre!("Failed to write response body: {}", e))?;

  // The process is about to exit, so let the background write finish.
  // The response is already out; a failed write only costs the cache entry.
  if let Some(write) = delivery.cache_write {
    if let Err(e) = write.settled().await {
      warn!(error = %e, "Cache write failed");
    }
  }

  host.close_client(client).await
}

fn list_caches(config: &Config, storage: &SqliteStorage) -> Result<()> {
  for name in storage.namespaces()? {
    let marker = if name == config.cache_name { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, storage.entry_count(&name)?);
  }
  Ok(())
}
