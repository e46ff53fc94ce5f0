//! Host that drives an interceptor through install, activation and fetches.
//!
//! Plays the part a browser plays for an offline worker: it keeps track of
//! which version is active, which clients (pages) that version controls,
//! and routes each client's requests either through the interceptor or
//! straight to the network.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheKey;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::proxy::{CacheWrite, Interception, LifecycleHandler, ResponseSource};

pub type WorkerId = u64;
pub type ClientId = u64;

struct Worker<H> {
  id: WorkerId,
  handler: Arc<H>,
}

/// What happened to a newly registered version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
  /// Installed and now serving. Lists the namespaces removed on activation.
  Activated { deleted: Vec<String> },
  /// Installed, waiting for the current version's clients to close
  Waiting,
}

/// A response handed back to a client.
#[derive(Debug)]
pub struct Delivery {
  pub response: Response,
  pub source: ResponseSource,
  /// Pending cache write. Dropping it leaves the write running in the background.
  pub cache_write: Option<CacheWrite>,
}

pub struct Host<H, N> {
  network: Arc<N>,
  active: Option<Worker<H>>,
  waiting: Option<Worker<H>>,
  /// Open clients and the version controlling each, if any
  clients: BTreeMap<ClientId, Option<WorkerId>>,
  next_worker: WorkerId,
  next_client: ClientId,
}

impl<H, N> Host<H, N>
where
  H: LifecycleHandler,
  N: Network,
{
  pub fn new(network: Arc<N>) -> Self {
    Self {
      network,
      active: None,
      waiting: None,
      clients: BTreeMap::new(),
      next_worker: 1,
      next_client: 1,
    }
  }

  /// Install a new version.
  ///
  /// The version is activated straight away when it asks to skip waiting
  /// or when no client is controlled by the current version. Otherwise it
  /// waits until those clients close. A failed setup discards the new
  /// version and leaves the current one in place. A successful one
  /// replaces any version that was still waiting.
  pub async fn register(&mut self, handler: H) -> Result<Registration> {
    let worker = Worker {
      id: self.next_worker_id(),
      handler: Arc::new(handler),
    };

    info!(worker = worker.id, "Installing");
    let setup = worker
      .handler
      .on_setup()
      .await
      .map_err(|e| eyre!("Install of version {} failed: {}", worker.id, e))?;

    if let Some(stale) = self.waiting.take() {
      info!(worker = stale.id, replaced_by = worker.id, "Dropped waiting version");
    }

    if setup.skip_waiting || !self.has_controlled_clients() {
      let deleted = self.activate(worker).await?;
      Ok(Registration::Activated { deleted })
    } else {
      info!(worker = worker.id, "Waiting for clients of the current version to close");
      self.waiting = Some(worker);
      Ok(Registration::Waiting)
    }
  }

  /// Treat an already installed version as active without replaying its
  /// install or activation.
  pub fn resume(&mut self, handler: H) -> WorkerId {
    let worker = Worker {
      id: self.next_worker_id(),
      handler: Arc::new(handler),
    };
    let id = worker.id;
    debug!(worker = id, "Resumed");
    self.active = Some(worker);
    id
  }

  async fn activate(&mut self, worker: Worker<H>) -> Result<Vec<String>> {
    info!(worker = worker.id, "Activating");
    let outcome = worker
      .handler
      .on_transition()
      .await
      .map_err(|e| eyre!("Activation of version {} failed: {}", worker.id, e))?;

    let id = worker.id;
    self.active = Some(worker);

    if outcome.claim_clients {
      for controller in self.clients.values_mut() {
        *controller = Some(id);
      }
      debug!(worker = id, clients = self.clients.len(), "Claimed clients");
    }

    Ok(outcome.deleted)
  }

  /// Open a client. It is controlled by the active version, if there is one.
  pub fn open_client(&mut self) -> ClientId {
    let id = self.next_client;
    self.next_client += 1;
    let controller = self.active.as_ref().map(|w| w.id);
    self.clients.insert(id, controller);
    id
  }

  /// Close a client. Closing the last controlled client lets a waiting
  /// version activate.
  pub async fn close_client(&mut self, client: ClientId) -> Result<()> {
    self
      .clients
      .remove(&client)
      .ok_or_else(|| eyre!("Unknown client {}", client))?;

    if !self.has_controlled_clients() {
      if let Some(worker) = self.waiting.take() {
        self.activate(worker).await?;
      }
    }

    Ok(())
  }

  pub fn active_version(&self) -> Option<WorkerId> {
    self.active.as_ref().map(|w| w.id)
  }

  #[cfg(test)]
  pub fn waiting_version(&self) -> Option<WorkerId> {
    self.waiting.as_ref().map(|w| w.id)
  }

  /// Whether the client's requests go through the active version.
  pub fn is_controlled(&self, client: ClientId) -> bool {
    match (self.clients.get(&client), self.active_version()) {
      (Some(Some(controller)), Some(active)) => *controller == active,
      _ => false,
    }
  }

  /// Fetch on behalf of a client.
  ///
  /// Requests from a controlled client go through the interceptor; anything
  /// it passes on, and every request from an uncontrolled client, goes
  /// straight to the network. A request the interceptor cannot answer is
  /// a failed load.
  pub async fn fetch(&self, client: ClientId, request: Request) -> Result<Delivery> {
    if !self.clients.contains_key(&client) {
      return Err(eyre!("Unknown client {}", client));
    }

    let handler = match &self.active {
      Some(worker) if self.is_controlled(client) => Arc::clone(&worker.handler),
      _ => return self.fetch_network(request).await,
    };

    let description = request.description();
    match handler.on_intercept(request.clone()).await {
      Interception::Passthrough => self.fetch_network(request).await,
      Interception::Responded {
        response,
        source,
        cache_write,
      } => {
        debug!(request = %description, ?source, status = response.status, "Intercepted");
        Ok(Delivery {
          response,
          source,
          cache_write,
        })
      }
      Interception::Unresolved => Err(eyre!(
        "Failed to load {}: network unavailable and nothing cached",
        description
      )),
    }
  }

  async fn fetch_network(&self, request: Request) -> Result<Delivery> {
    let response = self.network.fetch(request).await?;
    Ok(Delivery {
      response,
      source: ResponseSource::Network,
      cache_write: None,
    })
  }

  fn has_controlled_clients(&self) -> bool {
    match self.active_version() {
      Some(active) => self.clients.values().any(|c| *c == Some(active)),
      None => false,
    }
  }

  fn next_worker_id(&mut self) -> WorkerId {
    let id = self.next_worker;
    self.next_worker += 1;
    id
  }
}
