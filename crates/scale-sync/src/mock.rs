//! # Mock Device Link
//!
//! An in-memory scale for tests and bench setups.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MockLinkFactory                                                        │
//! │    ├── link(id) ──► Arc<MockLink>   (same instance on every connect)   │
//! │    └── fail_next_connect(err)                                           │
//! │                                                                         │
//! │  MockLink                                                               │
//! │    ├── PLU table (accepted pushes are written into it)                 │
//! │    ├── queued failures, or one failure on every call                   │
//! │    ├── per-PLU rejections, whole-batch refusal rule                    │
//! │    ├── artificial latency (tokio time, so paused tests stay instant)   │
//! │    └── counters: fetches, pushes, max concurrent calls                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scale_core::{DeviceId, Plu, Product};

use crate::error::{LinkError, LinkResult};
use crate::link::{ConnectionParams, DeviceLink, DeviceLinkFactory, EntryAck};

type BatchRule = Arc<dyn Fn(&[Product]) -> bool + Send + Sync>;

#[derive(Default)]
struct MockState {
    products: Vec<Product>,
    failures: VecDeque<LinkError>,
    always_fail: Option<LinkError>,
    rejections: HashMap<Plu, String>,
    refuse_batch: Option<BatchRule>,
    latency: Duration,
    pushed: Vec<Vec<Product>>,
}

/// Scriptable scale.
#[derive(Default)]
pub struct MockLink {
    state: Mutex<MockState>,
    fetches: AtomicUsize,
    pushes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: Vec<Product>) -> Self {
        let link = Self::default();
        link.set_products(products);
        link
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Replaces the device's table.
    pub fn set_products(&self, products: Vec<Product>) {
        self.state().products = products;
    }

    /// The device's table as it stands.
    pub fn products(&self) -> Vec<Product> {
        self.state().products.clone()
    }

    /// Fails the next call (fetch or push) with `err`. Queues.
    pub fn fail_next(&self, err: LinkError) {
        self.state().failures.push_back(err);
    }

    /// Fails every call until cleared with `None`.
    pub fn fail_always(&self, err: Option<LinkError>) {
        self.state().always_fail = err;
    }

    /// Refuses this PLU on every push.
    pub fn reject_plu(&self, plu: Plu, reason: impl Into<String>) {
        self.state().rejections.insert(plu, reason.into());
    }

    /// Refuses a whole push with a protocol error when `rule` returns true.
    pub fn refuse_batches_where<F>(&self, rule: F)
    where
        F: Fn(&[Product]) -> bool + Send + Sync + 'static,
    {
        self.state().refuse_batch = Some(Arc::new(rule));
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Every push payload received, accepted or not.
    pub fn pushed(&self) -> Vec<Vec<Product>> {
        self.state().pushed.clone()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn round_trip(&self) -> LinkResult<()> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        match &state.always_fail {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn fetch_all(&self) -> LinkResult<Vec<Product>> {
        let _flight = self.enter();
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        Ok(self.products())
    }

    async fn push_patch(&self, changes: &[Product]) -> LinkResult<Vec<EntryAck>> {
        let _flight = self.enter();
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.state().pushed.push(changes.to_vec());
        self.round_trip().await?;

        let mut state = self.state();
        if let Some(rule) = &state.refuse_batch {
            if rule(changes) {
                return Err(LinkError::Protocol("upload refused".to_string()));
            }
        }

        let mut acks = Vec::with_capacity(changes.len());
        for product in changes {
            if let Some(reason) = state.rejections.get(&product.plu) {
                acks.push(EntryAck::Rejected {
                    plu: product.plu,
                    reason: reason.clone(),
                });
                continue;
            }
            match state.products.iter_mut().find(|p| p.plu == product.plu) {
                Some(slot) => *slot = product.clone(),
                None => state.products.push(product.clone()),
            }
            acks.push(EntryAck::Accepted(product.plu));
        }
        Ok(acks)
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Hands out one `MockLink` per device id.
#[derive(Default)]
pub struct MockLinkFactory {
    links: Mutex<HashMap<DeviceId, Arc<MockLink>>>,
    connect_failures: Mutex<VecDeque<LinkError>>,
    connects: AtomicUsize,
}

impl MockLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's mock, created empty on first use.
    pub fn link(&self, device_id: DeviceId) -> Arc<MockLink> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.entry(device_id).or_default().clone()
    }

    pub fn fail_next_connect(&self, err: LinkError) {
        let mut failures = self
            .connect_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        failures.push_back(err);
    }

    /// Number of sessions opened (including failed attempts).
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceLinkFactory for MockLinkFactory {
    async fn connect(&self, params: &ConnectionParams) -> LinkResult<Arc<dyn DeviceLink>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut failures = self
                .connect_failures
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            failures.pop_front()
        };
        if let Some(err) = failure {
            return Err(err);
        }
        let link: Arc<dyn DeviceLink> = self.link(params.descriptor.id);
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scale_core::Money;

    fn product(n: u32) -> Product {
        Product::new(Plu::new(n).unwrap(), format!("Item {}", n), Money::from_cents(100))
    }

    #[tokio::test]
    async fn test_push_writes_accepted_entries() {
        let link = MockLink::with_products(vec![product(1)]);
        link.reject_plu(Plu::new(3).unwrap(), "table full");

        let mut changed = product(1);
        changed.price = Money::from_cents(250);
        let acks = link.push_patch(&[changed.clone(), product(2), product(3)]).await.unwrap();

        assert_eq!(acks.len(), 3);
        assert!(matches!(acks[2], EntryAck::Rejected { .. }));
        assert_eq!(link.products(), vec![changed, product(2)]);
    }

    #[tokio::test]
    async fn test_queued_failures() {
        let link = MockLink::with_products(vec![product(1)]);
        link.fail_next(LinkError::Connection("refused".into()));

        assert!(link.fetch_all().await.is_err());
        assert_eq!(link.fetch_all().await.unwrap().len(), 1);
        assert_eq!(link.fetch_count(), 2);
    }
}
