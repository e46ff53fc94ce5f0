//! Network-first cache proxy.
//!
//! The proxy answers three lifecycle triggers:
//! - setup: seed the current namespace with the shell resources
//! - transition: drop every namespace from older versions
//! - intercept: try the network, mirror good responses into the cache,
//!   and fall back to the cache when the network is unreachable

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage};
use crate::http::{Request, Response};
use crate::network::Network;

/// The three triggers a host dispatches to an interceptor.
pub trait LifecycleHandler: Send + Sync {
  /// Called once when the version is installed. The host does not
  /// consider the version ready until this resolves.
  fn on_setup(&self) -> BoxFuture<'_, Result<SetupOutcome>>;

  /// Called when the version becomes the active interceptor.
  fn on_transition(&self) -> BoxFuture<'_, Result<TransitionOutcome>>;

  /// Called for every request from a controlled client.
  fn on_intercept(&self, request: Request) -> BoxFuture<'_, Interception>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
  /// Activate right away instead of waiting for the previous version's clients to go
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
  /// Namespaces removed during this transition
  pub deleted: Vec<String>,
  /// Take control of every open client immediately
  pub claim_clients: bool,
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the network
  Network,
  /// Network unavailable, served from the cache
  Offline { cached_at: DateTime<Utc> },
}

/// Result of intercepting one request.
#[derive(Debug)]
pub enum Interception {
  /// Not handled; the host sends the request to the network untouched.
  Passthrough,
  /// A response for the caller.
  Responded {
    response: Response,
    source: ResponseSource,
    /// Background write of the response into the cache, if one was started
    cache_write: Option<CacheWrite>,
  },
  /// Network failed and nothing was cached. The caller sees a failed load.
  Unresolved,
}

/// Handle to a cache write running on its own task.
///
/// Dropping the handle detaches the task; the write still happens.
#[derive(Debug)]
pub struct CacheWrite(JoinHandle<Result<()>>);

impl CacheWrite {
  /// Wait for the write to land.
  pub async fn settled(self) -> Result<()> {
    self
      .0
      .await
      .map_err(|e| eyre!("Cache write task failed: {}", e))?
  }
}

/// Network-first proxy over a single cache namespace.
pub struct CacheProxy<N, S> {
  cache_name: String,
  seed: Vec<Url>,
  network: Arc<N>,
  storage: Arc<S>,
  skip_waiting: bool,
  claim_clients: bool,
}

impl<N, S> CacheProxy<N, S>
where
  N: Network,
  S: CacheStorage + 'static,
{
  pub fn new(cache_name: impl Into<String>, seed: Vec<Url>, network: Arc<N>, storage: Arc<S>) -> Self {
    Self {
      cache_name: cache_name.into(),
      seed,
      network,
      storage,
      skip_waiting: true,
      claim_clients: true,
    }
  }

  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  pub fn with_claim_clients(mut self, claim_clients: bool) -> Self {
    self.claim_clients = claim_clients;
    self
  }

  /// Open the namespace and store every seed resource.
  ///
  /// All seeds are fetched before anything is written; one rejected fetch
  /// or non-ok status fails the whole setup and stores nothing.
  pub async fn setup(&self) -> Result<SetupOutcome> {
    self.storage.open_namespace(&self.cache_name)?;

    let requests: Vec<Request> = self.seed.iter().cloned().map(Request::get).collect();
    let responses = future::try_join_all(requests.iter().cloned().map(|request| async move {
      let url = request.url.clone();
      let response = self.network.fetch(request).await?;
      if !response.ok() {
        return Err(eyre!(
          "Seed resource {} answered with status {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>(response)
    }))
    .await?;

    let entries: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();
    self.storage.put_all(&self.cache_name, &entries)?;

    info!(
      namespace = %self.cache_name,
      resources = entries.len(),
      "Seeded cache"
    );

    Ok(SetupOutcome {
      skip_waiting: self.skip_waiting,
    })
  }

  /// Delete every namespace except the current one.
  pub async fn transition(&self) -> Result<TransitionOutcome> {
    let mut deleted = Vec::new();

    for name in self.storage.namespaces()? {
      if name == self.cache_name {
        continue;
      }
      if self.storage.delete_namespace(&name)? {
        info!(namespace = %name, "Deleted stale cache");
        deleted.push(name);
      }
    }

    Ok(TransitionOutcome {
      deleted,
      claim_clients: self.claim_clients,
    })
  }

  /// Serve one request network-first.
  pub async fn intercept(&self, request: Request) -> Interception {
    if !request.is_cacheable() {
      return Interception::Passthrough;
    }

    match self.network.fetch(request.clone()).await {
      Ok(response) => {
        let cache_write = response
          .ok()
          .then(|| self.spawn_write(request, response.clone()));

        Interception::Responded {
          response,
          source: ResponseSource::Network,
          cache_write,
        }
      }
      Err(e) => {
        debug!(request = %request.description(), error = %e, "Network failed, trying cache");

        match self.storage.lookup(&self.cache_name, &request) {
          Ok(Some(cached)) => Interception::Responded {
            response: cached.response,
            source: ResponseSource::Offline {
              cached_at: cached.cached_at,
            },
            cache_write: None,
          },
          Ok(None) => {
            debug!(request = %request.description(), "Cache miss");
            Interception::Unresolved
          }
          Err(e) => {
            warn!(request = %request.description(), error = %e, "Cache lookup failed");
            Interception::Unresolved
          }
        }
      }
    }
  }

  /// Store a copy of the response on a separate task. The caller gets the
  /// original back without waiting for the write.
  fn spawn_write(&self, request: Request, response: Response) -> CacheWrite {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.cache_name.clone();

    CacheWrite(tokio::spawn(async move {
      let result = storage.put(&cache_name, &request, &response);
      match &result {
        Ok(()) => debug!(request = %request.description(), "Cached response"),
        Err(e) => warn!(request = %request.description(), error = %e, "Cache write failed"),
      }
      result
    }))
  }
}

impl<N, S> LifecycleHandler for CacheProxy<N, S>
where
  N: Network,
  S: CacheStorage + 'static,
{
  fn on_setup(&self) -> BoxFuture<'_, Result<SetupOutcome>> {
    Box::pin(self.setup())
  }

  fn on_transition(&self) -> BoxFuture<'_, Result<TransitionOutcome>> {
    Box::pin(self.transition())
  }

  fn on_intercept(&self, request: Request) -> BoxFuture<'_, Interception> {
    Box::pin(self.intercept(request))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::network::stub::StubNetwork;
  use reqwest::Method;

  const ORIGIN: &str = "http://localhost:8080/";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn seeded_network() -> Arc<StubNetwork> {
    let network = Arc::new(StubNetwork::new());
    network.route(url("index.html").as_str(), 200, "index");
    network.route(url("/").as_str(), 200, "root");
    network
  }

  fn proxy(
    name: &str,
    network: &Arc<StubNetwork>,
    storage: &Arc<SqliteStorage>,
  ) -> CacheProxy<StubNetwork, SqliteStorage> {
    CacheProxy::new(
      name,
      vec![url("index.html"), url("/")],
      Arc::clone(network),
      Arc::clone(storage),
    )
  }

  fn body(interception: &Interception) -> Option<&[u8]> {
    match interception {
      Interception::Responded { response, .. } => Some(response.body()),
      _ => None,
    }
  }

  #[tokio::test]
  async fn test_setup_seeds_every_path() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);

    let outcome = proxy.setup().await.unwrap();
    assert!(outcome.skip_waiting);

    for path in ["index.html", "/"] {
      let cached = storage.lookup("v1", &Request::get(url(path))).unwrap();
      assert!(cached.is_some(), "{} missing after setup", path);
    }
    assert_eq!(storage.namespaces().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_setup_stores_nothing_if_one_seed_fails() {
    let network = seeded_network();
    network.route(url("index.html").as_str(), 404, "not found");
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);

    assert!(proxy.setup().await.is_err());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_setup_stores_nothing_if_one_seed_is_unreachable() {
    let network = seeded_network();
    network.unroute(url("/").as_str());
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    assert!(proxy("v1", &network, &storage).setup().await.is_err());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
    assert!(storage
      .lookup("v1", &Request::get(url("index.html")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_setup_fails_offline() {
    let network = seeded_network();
    network.set_offline(true);
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    assert!(proxy("v1", &network, &storage).setup().await.is_err());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_transition_deletes_other_namespaces() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.open_namespace("v0").unwrap();
    proxy("v1", &network, &storage).setup().await.unwrap();

    let v2 = proxy("v2", &network, &storage);
    v2.setup().await.unwrap();
    let outcome = v2.transition().await.unwrap();

    assert_eq!(outcome.deleted, vec!["v0", "v1"]);
    assert!(outcome.claim_clients);
    assert_eq!(storage.namespaces().unwrap(), vec!["v2"]);
  }

  #[tokio::test]
  async fn test_transition_keeps_current_namespace() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();

    let outcome = proxy.transition().await.unwrap();
    assert!(outcome.deleted.is_empty());
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_network_success_is_returned_and_cached() {
    let network = seeded_network();
    network.route(url("app.js").as_str(), 200, "console.log(1)");
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);

    let request = Request::get(url("app.js"));
    let interception = proxy.intercept(request.clone()).await;

    let Interception::Responded {
      response,
      source,
      cache_write,
    } = interception
    else {
      panic!("expected a response");
    };
    assert_eq!(source, ResponseSource::Network);
    assert_eq!(response.body(), b"console.log(1)");

    cache_write.expect("ok response is cached").settled().await.unwrap();
    let cached = storage.lookup("v1", &request).unwrap().unwrap();
    assert_eq!(cached.response, response);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let network = seeded_network();
    network.route(url("missing").as_str(), 404, "nope");
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);

    let request = Request::get(url("missing"));
    let interception = proxy.intercept(request.clone()).await;

    match interception {
      Interception::Responded {
        response,
        cache_write,
        ..
      } => {
        assert_eq!(response.status, 404);
        assert!(cache_write.is_none());
      }
      other => panic!("unexpected {:?}", other),
    }
    assert!(storage.lookup("v1", &request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_serves_cached_response() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();

    network.set_offline(true);
    let interception = proxy.intercept(Request::get(url("index.html"))).await;

    assert_eq!(body(&interception), Some(&b"index"[..]));
    assert!(matches!(
      interception,
      Interception::Responded {
        source: ResponseSource::Offline { .. },
        cache_write: None,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn test_offline_ignores_fragment() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();

    network.set_offline(true);
    let interception = proxy
      .intercept(Request::get(url("index.html#section-2")))
      .await;
    assert_eq!(body(&interception), Some(&b"index"[..]));
  }

  #[tokio::test]
  async fn test_fragment_request_refreshes_plain_entry() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();

    network.route(url("index.html").as_str(), 200, "index v2");
    let interception = proxy.intercept(Request::get(url("index.html#top"))).await;
    if let Interception::Responded {
      cache_write: Some(write),
      ..
    } = interception
    {
      write.settled().await.unwrap();
    } else {
      panic!("expected a cached network response");
    }

    let cached = storage
      .lookup("v1", &Request::get(url("index.html")))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body(), b"index v2");
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_offline_miss_is_unresolved() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();

    network.set_offline(true);
    let interception = proxy.intercept(Request::get(url("never-seen.css"))).await;
    assert!(matches!(interception, Interception::Unresolved));
  }

  #[tokio::test]
  async fn test_mutating_requests_pass_through() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage);
    proxy.setup().await.unwrap();
    let calls_after_setup = network.calls();

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
      let request = Request::new(method, url("/"));
      let interception = proxy.intercept(request.clone()).await;
      assert!(matches!(interception, Interception::Passthrough));
      assert!(storage.lookup("v1", &request).unwrap().is_none());
    }

    // The proxy itself never touched the network for them
    assert_eq!(network.calls(), calls_after_setup);
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_outcome_flags_follow_builder() {
    let network = seeded_network();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let proxy = proxy("v1", &network, &storage)
      .with_skip_waiting(false)
      .with_claim_clients(false);

    assert!(!proxy.on_setup().await.unwrap().skip_waiting);
    assert!(!proxy.on_transition().await.unwrap().claim_clients);
  }

  #[tokio::test]
  async fn test_install_upgrade_and_offline_scenario() {
    let network = Arc::new(StubNetwork::new());
    network.route(url("index.html").as_str(), 200, "shell");
    network.route(url("/").as_str(), 200, "shell");
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    // Install v1, then upgrade to v2
    proxy("v1", &network, &storage).on_setup().await.unwrap();
    let v2 = proxy("v2", &network, &storage);
    v2.on_setup().await.unwrap();
    v2.on_transition().await.unwrap();
    assert_eq!(storage.namespaces().unwrap(), vec!["v2"]);

    // Online: network response wins and is mirrored
    network.route(url("/").as_str(), 200, "A");
    let root = Request::get(url("/"));
    let interception = v2.on_intercept(root.clone()).await;
    assert_eq!(body(&interception), Some(&b"A"[..]));
    if let Interception::Responded {
      cache_write: Some(write),
      ..
    } = interception
    {
      write.settled().await.unwrap();
    }
    let cached = storage.lookup("v2", &root).unwrap().unwrap();
    assert_eq!(cached.response.body(), b"A");

    // Offline: cached copy is served
    network.set_offline(true);
    let interception = v2.on_intercept(root).await;
    assert_eq!(body(&interception), Some(&b"A"[..]));
  }
}
