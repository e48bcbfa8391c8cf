//! Request routing and load balancing
//!
//! The router maps model names to registered clients and picks the least
//! loaded healthy client for each request. Load is the number of requests in
//! flight on a client divided by its weight.

use crate::client::Client;
use distillr_common::config::{ClientDescriptor, RouterConfig};
use distillr_common::{DistillError, Result, METRICS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Routing state of one registered client
#[derive(Debug)]
struct ClientState {
    client: Client,

    /// Requests currently in flight
    inflight: Arc<AtomicUsize>,

    healthy: bool,

    /// Number of consecutive failures
    failure_count: u32,
}

impl ClientState {
    fn new(client: Client) -> Self {
        Self {
            client,
            inflight: Arc::new(AtomicUsize::new(0)),
            healthy: true,
            failure_count: 0,
        }
    }

    /// Calculate load score for routing (lower is better)
    fn load_score(&self) -> f64 {
        let weight = self.client.descriptor.weight.max(1);
        self.inflight.load(Ordering::Acquire) as f64 / weight as f64
    }

    fn serves(&self, model: Option<&str>) -> bool {
        model.map_or(true, |m| self.client.model() == m)
    }
}

/// A client checked out for one request
///
/// Counts as in flight on the client until dropped.
#[derive(Debug)]
pub struct ClientGuard {
    client: Client,
    inflight: Arc<AtomicUsize>,
}

impl ClientGuard {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl std::ops::Deref for ClientGuard {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Router for distributing requests across clients
pub struct ModelRouter {
    /// Registered clients, in registration order
    clients: RwLock<Vec<ClientState>>,

    health_check_interval: Duration,

    /// Failure threshold before marking unhealthy
    failure_threshold: u32,
}

impl ModelRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    /// Router with `clients` registered in order
    pub async fn with_clients(config: &RouterConfig, clients: Vec<Client>) -> Result<Self> {
        let router = Self::new(config);
        for client in clients {
            router.register(client).await?;
        }
        Ok(router)
    }

    /// Register a client
    pub async fn register(&self, client: Client) -> Result<()> {
        let mut clients = self.clients.write().await;
        if clients.iter().any(|c| c.client.id() == client.id()) {
            return Err(DistillError::invalid_input(format!(
                "Client {} is already registered",
                client.id()
            )));
        }

        info!(
            "Registered client: {} ({}) at {}",
            client.id(),
            client.model(),
            client.descriptor.endpoint
        );
        clients.push(ClientState::new(client));
        METRICS.router.active_clients.set(clients.len() as i64);
        Ok(())
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|c| c.client.id() != id);
        if clients.len() == before {
            return Err(DistillError::client_unavailable(format!(
                "Client {} is not registered",
                id
            )));
        }

        METRICS.router.active_clients.set(clients.len() as i64);
        update_unhealthy_gauge(&clients);
        info!("Unregistered client: {}", id);
        Ok(())
    }

    /// Descriptors of all registered clients
    pub async fn model_infos(&self) -> Vec<ClientDescriptor> {
        let clients = self.clients.read().await;
        clients.iter().map(|c| c.client.descriptor.clone()).collect()
    }

    /// Select the best healthy client for `model`, or for any model when `None`
    ///
    /// Ties go to the client registered first.
    pub async fn select(&self, model: Option<&str>) -> Result<Client> {
        let clients = self.clients.read().await;
        let state = pick(&clients, model, false)?;
        Ok(state.client.clone())
    }

    /// Select a client and count the request in flight until the guard drops
    ///
    /// Healthy clients are preferred. When every client serving `model` is
    /// unhealthy the one with the fewest consecutive failures is used, so
    /// requests keep probing a backend that has not been rechecked yet.
    pub async fn acquire(&self, model: Option<&str>) -> Result<ClientGuard> {
        let clients = self.clients.read().await;
        let state = pick(&clients, model, true)?;

        state.inflight.fetch_add(1, Ordering::AcqRel);
        METRICS.router.requests_routed.inc();

        Ok(ClientGuard {
            client: state.client.clone(),
            inflight: Arc::clone(&state.inflight),
        })
    }

    /// Mark client as failed
    pub async fn mark_failed(&self, id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(state) = clients.iter_mut().find(|c| c.client.id() == id) {
            state.failure_count += 1;

            if state.healthy && state.failure_count >= self.failure_threshold {
                state.healthy = false;
                warn!(
                    "Client {} marked as unhealthy after {} failures",
                    id, state.failure_count
                );
            }
        }
        update_unhealthy_gauge(&clients);
    }

    /// Mark client as healthy
    pub async fn mark_healthy(&self, id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(state) = clients.iter_mut().find(|c| c.client.id() == id) {
            if !state.healthy {
                info!("Client {} is healthy again", id);
            }
            state.healthy = true;
            state.failure_count = 0;
            debug!("Client {} marked as healthy", id);
        }
        update_unhealthy_gauge(&clients);
    }

    /// Whether the client is currently eligible for routing
    pub async fn is_healthy(&self, id: &str) -> Option<bool> {
        let clients = self.clients.read().await;
        clients.iter().find(|c| c.client.id() == id).map(|c| c.healthy)
    }

    /// Requests in flight on a client
    pub async fn inflight(&self, id: &str) -> Option<usize> {
        let clients = self.clients.read().await;
        clients
            .iter()
            .find(|c| c.client.id() == id)
            .map(|c| c.inflight.load(Ordering::Acquire))
    }

    /// Get number of healthy clients
    pub async fn healthy_client_count(&self) -> usize {
        let clients = self.clients.read().await;
        clients.iter().filter(|c| c.healthy).count()
    }

    /// Start background health check task
    pub fn start_health_checks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.health_check_interval);

            loop {
                interval.tick().await;
                self.check_all().await;
            }
        })
    }

    /// Poll every client's health check once
    pub async fn check_all(&self) {
        let snapshot: Vec<Client> = {
            let clients = self.clients.read().await;
            clients.iter().map(|c| c.client.clone()).collect()
        };

        for client in snapshot {
            match client.engine.health_check().await {
                Ok(true) => self.mark_healthy(client.id()).await,
                Ok(false) => {
                    debug!("Client {} reports unhealthy", client.id());
                    self.mark_failed(client.id()).await;
                }
                Err(e) => {
                    warn!("Health check failed for {}: {}", client.id(), e);
                    self.mark_failed(client.id()).await;
                }
            }
        }
    }
}

fn pick<'a>(
    clients: &'a [ClientState],
    model: Option<&str>,
    allow_unhealthy: bool,
) -> Result<&'a ClientState> {
    if clients.is_empty() {
        METRICS.router.no_clients_available.inc();
        return Err(DistillError::client_unavailable("No clients registered"));
    }

    // Find healthy client with lowest load score
    let best = clients
        .iter()
        .filter(|c| c.healthy && c.serves(model))
        .min_by(|a, b| {
            a.load_score()
                .partial_cmp(&b.load_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let best = match best {
        Some(state) => Some(state),
        None if allow_unhealthy => {
            let fallback = clients
                .iter()
                .filter(|c| c.serves(model))
                .min_by(|a, b| {
                    a.failure_count.cmp(&b.failure_count).then(
                        a.load_score()
                            .partial_cmp(&b.load_score())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                });
            if let Some(state) = fallback {
                debug!(
                    "No healthy client, falling back to {} after {} failures",
                    state.client.id(),
                    state.failure_count
                );
            }
            fallback
        }
        None => None,
    };

    match best {
        Some(state) => {
            debug!(
                "Selected client {} with {} requests in flight",
                state.client.id(),
                state.inflight.load(Ordering::Acquire)
            );
            Ok(state)
        }
        None => {
            METRICS.router.no_clients_available.inc();
            Err(DistillError::client_unavailable(match model {
                Some(m) => format!("No healthy client serves model {}", m),
                None => "No healthy clients available".to_string(),
            }))
        }
    }
}

fn update_unhealthy_gauge(clients: &[ClientState]) {
    let unhealthy = clients.iter().filter(|c| !c.healthy).count();
    METRICS.router.unhealthy_clients.set(unhealthy as i64);
}
