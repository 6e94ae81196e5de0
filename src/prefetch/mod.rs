//! Background warming of per-role resource bundles.
//!
//! Triggers are fire-and-forget and coalesce: while a bundle is loading,
//! further triggers join the running load instead of starting another.

mod bundle;

pub use bundle::{
  active_term_id, Bundle, PrefetchContext, Resource, ResourceRequest, Role, Scope, SCHOOL_TERMS,
  TERMS_TTL,
};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::Signature;
use crate::client::CachedClient;
use crate::transport::Transport;

/// Default delay between a view becoming active and its prefetch
pub const DEFAULT_PREFETCH_DELAY: Duration = Duration::from_secs(1);

/// Completion of a prefetch.
///
/// Dropping the handle does not cancel the load. Awaiting it waits for every
/// resource of the bundle to settle.
#[derive(Clone)]
pub struct PrefetchHandle(HandleState);

#[derive(Clone)]
enum HandleState {
  Ready,
  Pending(Shared<BoxFuture<'static, ()>>),
}

impl PrefetchHandle {
  fn ready() -> Self {
    Self(HandleState::Ready)
  }

  /// Whether the trigger started no work, or the load has been awaited to
  /// completion through some clone of this handle.
  pub fn is_ready(&self) -> bool {
    match &self.0 {
      HandleState::Ready => true,
      HandleState::Pending(future) => future.peek().is_some(),
    }
  }
}

impl IntoFuture for PrefetchHandle {
  type Output = ();
  type IntoFuture = BoxFuture<'static, ()>;

  fn into_future(self) -> Self::IntoFuture {
    match self.0 {
      HandleState::Ready => futures::future::ready(()).boxed(),
      HandleState::Pending(future) => future.boxed(),
    }
  }
}

struct Running {
  loads: HashMap<String, (u64, PrefetchHandle)>,
  next_generation: u64,
}

struct Inner<T: Transport> {
  client: CachedClient<T>,
  bundles: Mutex<HashMap<String, Bundle>>,
  running: Mutex<Running>,
  delay: Duration,
}

/// Warms bundles of resources through the cached client.
pub struct Prefetcher<T: Transport> {
  inner: Arc<Inner<T>>,
}

impl<T: Transport> Prefetcher<T> {
  /// Create a prefetcher with the built-in role bundles registered.
  pub fn new(client: CachedClient<T>, delay: Duration) -> Self {
    let bundles = Bundle::builtin()
      .into_iter()
      .map(|b| (b.name.clone(), b))
      .collect();

    Self {
      inner: Arc::new(Inner {
        client,
        bundles: Mutex::new(bundles),
        running: Mutex::new(Running {
          loads: HashMap::new(),
          next_generation: 0,
        }),
        delay,
      }),
    }
  }

  pub fn delay(&self) -> Duration {
    self.inner.delay
  }

  /// Register a bundle, replacing any bundle with the same name.
  pub fn register_bundle(&self, bundle: Bundle) {
    debug!(bundle = %bundle.name, resources = bundle.resources.len(), "registered bundle");
    lock(&self.inner.bundles).insert(bundle.name.clone(), bundle);
  }

  pub fn bundle(&self, name: &str) -> Option<Bundle> {
    lock(&self.inner.bundles).get(name).cloned()
  }

  pub fn bundle_names(&self) -> Vec<String> {
    let mut names: Vec<String> = lock(&self.inner.bundles).keys().cloned().collect();
    names.sort();
    names
  }

  pub fn is_running(&self, name: &str) -> bool {
    lock(&self.inner.running).loads.contains_key(name)
  }

  /// Start warming `name` in the background.
  ///
  /// - Unknown bundle - warn, nothing to do
  /// - Already loading - join the running load
  /// - Every resource already cached - nothing to do
  /// - Otherwise spawn a task loading all resources concurrently
  pub fn trigger_prefetch(&self, name: &str, context: PrefetchContext) -> PrefetchHandle {
    let Some(bundle) = self.bundle(name) else {
      warn!(bundle = name, "unknown prefetch bundle");
      return PrefetchHandle::ready();
    };

    let mut running = lock(&self.inner.running);
    if let Some((_, handle)) = running.loads.get(name) {
      debug!(bundle = name, "prefetch already running");
      return handle.clone();
    }

    if self.is_warm(&bundle, &context) {
      debug!(bundle = name, "bundle already cached");
      return PrefetchHandle::ready();
    }

    let generation = running.next_generation;
    running.next_generation += 1;

    let client = self.inner.client.clone();
    let worker = tokio::spawn(load_bundle(client, bundle, context));

    let inner = Arc::clone(&self.inner);
    let bundle_name = name.to_string();
    let supervisor = tokio::spawn(async move {
      if let Err(e) = worker.await {
        error!(bundle = %bundle_name, error = %e, "prefetch task failed");
      }
      let mut running = lock(&inner.running);
      if running
        .loads
        .get(&bundle_name)
        .is_some_and(|(current, _)| *current == generation)
      {
        running.loads.remove(&bundle_name);
      }
    });

    let handle = PrefetchHandle(HandleState::Pending(
      async move {
        // The supervisor only fails if the runtime shuts down
        let _ = supervisor.await;
      }
      .boxed()
      .shared(),
    ));
    running
      .loads
      .insert(name.to_string(), (generation, handle.clone()));
    handle
  }

  /// Trigger `name` after the configured delay.
  ///
  /// The returned task finishes when the triggered load does.
  pub fn schedule_prefetch(&self, name: &str, context: PrefetchContext) -> JoinHandle<()> {
    let prefetcher = self.clone();
    let name = name.to_string();
    tokio::spawn(async move {
      tokio::time::sleep(prefetcher.inner.delay).await;
      prefetcher.trigger_prefetch(&name, context).await;
    })
  }

  /// Whether every resource of `bundle` is fresh within its own TTL.
  fn is_warm(&self, bundle: &Bundle, context: &PrefetchContext) -> bool {
    let client = &self.inner.client;
    let mut context = context.clone();

    if bundle.resolve_active_term && context.term_id.is_none() {
      match client.cache().peek(&Signature::get(SCHOOL_TERMS), TERMS_TTL) {
        Some(terms) => context.term_id = active_term_id(&terms),
        None => return false,
      }
    }

    let default_ttl = client.cache().default_ttl();
    let (requests, _) = bundle.requests(&context);
    requests.iter().all(|r| {
      client.is_cached_within(&r.path, &r.params(), r.ttl.unwrap_or(default_ttl))
    })
  }
}

impl<T: Transport> Clone for Prefetcher<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

async fn load_bundle<T: Transport>(
  client: CachedClient<T>,
  bundle: Bundle,
  mut context: PrefetchContext,
) {
  let start = Instant::now();
  info!(bundle = %bundle.name, "prefetch started");

  if bundle.resolve_active_term && context.term_id.is_none() {
    match client.get_with_ttl(SCHOOL_TERMS, &[], TERMS_TTL).await {
      Ok(terms) => {
        context.term_id = active_term_id(&terms);
        if context.term_id.is_none() {
          warn!(bundle = %bundle.name, "no active school term");
        }
      }
      Err(e) => warn!(bundle = %bundle.name, error = %e, "failed to resolve active term"),
    }
  }

  let (requests, skipped) = bundle.requests(&context);
  for resource in skipped {
    warn!(bundle = %bundle.name, %resource, "skipping resource, context incomplete");
  }

  let default_ttl = client.cache().default_ttl();
  let results = futures::future::join_all(requests.iter().map(|request| {
    let client = &client;
    async move {
      let params = request.params();
      let ttl = request.ttl.unwrap_or(default_ttl);
      (request, client.get_with_ttl(&request.path, &params, ttl).await)
    }
  }))
  .await;

  let mut failed = 0;
  for (request, result) in &results {
    if let Err(e) = result {
      failed += 1;
      warn!(bundle = %bundle.name, path = %request.path, error = %e, "prefetch request failed");
    }
  }

  info!(
    bundle = %bundle.name,
    loaded = results.len() - failed,
    failed,
    elapsed_ms = start.elapsed().as_millis() as u64,
    "prefetch finished"
  );
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheLayer;
  use crate::error::TransportError;
  use crate::transport::mock::MockTransport;
  use serde_json::json;

  const LATENCY: Duration = Duration::from_millis(100);

  fn admin_transport() -> MockTransport {
    MockTransport::new()
      .with_delay(LATENCY)
      .route("/users", json!([{"id": 1}]))
      .route("/roles", json!(["admin"]))
      .route("/departments", json!([{"department_id": 2}]))
      .route("/school-terms", json!([{"term_id": 7, "is_active": true}]))
  }

  fn prefetcher(transport: &MockTransport) -> Prefetcher<MockTransport> {
    let client = CachedClient::new(transport.clone(), CacheLayer::default());
    Prefetcher::new(client, DEFAULT_PREFETCH_DELAY)
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_triggers_coalesce() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);

    let first = prefetcher.trigger_prefetch("admin-bundle", PrefetchContext::default());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = prefetcher.trigger_prefetch("admin-bundle", PrefetchContext::default());

    first.await;
    second.await;
    assert_eq!(transport.total_calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_handle_still_loads() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);

    drop(prefetcher.trigger_prefetch("admin-bundle", PrefetchContext::default()));
    assert!(prefetcher.is_running("admin-bundle"));

    tokio::time::sleep(LATENCY * 2).await;
    assert!(!prefetcher.is_running("admin-bundle"));
    assert_eq!(transport.total_calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_warm_bundle_is_noop() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("admin-bundle", PrefetchContext::default())
      .await;
    let again = prefetcher.trigger_prefetch("admin-bundle", PrefetchContext::default());

    assert!(again.is_ready());
    assert!(!prefetcher.is_running("admin-bundle"));
    assert_eq!(transport.total_calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_resource_does_not_abort_bundle() {
    let transport = admin_transport();
    transport.set_route(
      "/roles",
      Err(TransportError::Status {
        status: 500,
        message: "down".to_string(),
      }),
    );
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("admin-bundle", PrefetchContext::default())
      .await;

    let client = &prefetcher.inner.client;
    assert!(client.is_cached("/users", &[]));
    assert!(client.is_cached("/departments", &[]));
    assert!(!client.is_cached("/roles", &[]));
    assert!(!prefetcher.is_running("admin-bundle"));

    // A later trigger retries what is missing
    transport.set_route("/roles", Ok(json!(["admin"])));
    prefetcher
      .trigger_prefetch("admin-bundle", PrefetchContext::default())
      .await;
    assert!(client.is_cached("/roles", &[]));
    assert_eq!(transport.calls("/roles"), 2);
    assert_eq!(transport.calls("/users"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dean_bundle_resolves_active_term() {
    let transport = MockTransport::new()
      .route(
        "/school-terms",
        json!([
          {"term_id": 1, "is_active": false},
          {"term_id": 7, "is_active": true}
        ]),
      )
      .route("/assessments/dean-analytics/sample", json!({"averages": []}))
      .route("/section-courses/assigned", json!([]));
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("dean-bundle", PrefetchContext::default())
      .await;

    let client = &prefetcher.inner.client;
    assert!(client.is_cached("/assessments/dean-analytics/sample", &[("term_id", "7")]));
    assert!(!client.is_cached("/assessments/dean-analytics/sample", &[]));
    assert_eq!(transport.calls("/school-terms"), 1);
    assert_eq!(transport.total_calls(), 3);

    let again = prefetcher.trigger_prefetch("dean-bundle", PrefetchContext::default());
    assert!(again.is_ready());
  }

  #[tokio::test(start_paused = true)]
  async fn test_long_ttl_resource_stays_warm() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);
    prefetcher.register_bundle(Bundle::new(
      "lookup-bundle",
      vec![
        Resource::path("/departments").with_ttl(Duration::from_secs(30 * 60)),
        Resource::path("/roles"),
      ],
    ));

    prefetcher
      .trigger_prefetch("lookup-bundle", PrefetchContext::default())
      .await;
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    // Only the default-TTL resource has gone stale
    let again = prefetcher.trigger_prefetch("lookup-bundle", PrefetchContext::default());
    assert!(!again.is_ready());
    again.await;
    assert_eq!(transport.calls("/departments"), 1);
    assert_eq!(transport.calls("/roles"), 2);

    let client = &prefetcher.inner.client;
    assert!(!client.is_cached("/departments", &[]));
    assert!(client.is_cached_within("/departments", &[], Duration::from_secs(30 * 60)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dean_bundle_refreshes_by_resource_ttl() {
    let transport = MockTransport::new()
      .route("/school-terms", json!([{"term_id": 7, "is_active": true}]))
      .route("/assessments/dean-analytics/sample", json!({}))
      .route("/section-courses/assigned", json!([]));
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("dean-bundle", PrefetchContext::default())
      .await;
    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    prefetcher
      .trigger_prefetch("dean-bundle", PrefetchContext::default())
      .await;

    assert_eq!(transport.calls("/school-terms"), 1);
    assert_eq!(transport.calls("/assessments/dean-analytics/sample"), 1);
    assert_eq!(transport.calls("/section-courses/assigned"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_term_failure_falls_back_to_unscoped() {
    let transport = MockTransport::new()
      .fail("/school-terms", TransportError::Network("reset".to_string()))
      .route("/assessments/dean-analytics/sample", json!({}))
      .route("/section-courses/assigned", json!([]));
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("dean-bundle", PrefetchContext::default())
      .await;

    let client = &prefetcher.inner.client;
    assert!(client.is_cached("/assessments/dean-analytics/sample", &[]));
    assert!(client.is_cached("/section-courses/assigned", &[]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_faculty_bundle_skips_without_id() {
    let transport = MockTransport::new()
      .route("/departments", json!([]))
      .route("/section-courses/faculty/12", json!([]));
    let prefetcher = prefetcher(&transport);

    prefetcher
      .trigger_prefetch("faculty-bundle", PrefetchContext::default())
      .await;
    assert_eq!(transport.total_calls(), 1);

    prefetcher
      .trigger_prefetch(
        "faculty-bundle",
        PrefetchContext::default().with_faculty_id("12"),
      )
      .await;
    assert_eq!(transport.calls("/section-courses/faculty/12"), 1);
    assert_eq!(transport.calls("/departments"), 1);
  }

  #[tokio::test]
  async fn test_unknown_bundle() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);

    let handle = prefetcher.trigger_prefetch("registrar-bundle", PrefetchContext::default());
    assert!(handle.is_ready());
    assert_eq!(transport.total_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_register_custom_bundle() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);
    prefetcher.register_bundle(Bundle::new(
      "lookup-bundle",
      vec![Resource::path("/roles"), Resource::path("/departments")],
    ));

    prefetcher
      .trigger_prefetch("lookup-bundle", PrefetchContext::default())
      .await;
    assert_eq!(transport.total_calls(), 2);
    assert!(prefetcher.bundle_names().contains(&"lookup-bundle".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedule_waits_for_delay() {
    let transport = admin_transport();
    let prefetcher = prefetcher(&transport);

    let task = prefetcher.schedule_prefetch("admin-bundle", PrefetchContext::default());
    tokio::time::sleep(DEFAULT_PREFETCH_DELAY - Duration::from_millis(1)).await;
    assert_eq!(transport.total_calls(), 0);

    task.await.unwrap();
    assert_eq!(transport.total_calls(), 4);
  }
}
