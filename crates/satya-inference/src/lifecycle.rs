//! Resource lifecycle manager.
//!
//! Owns every [`BackendHandle`] and decides which backends are resident.
//! Backends load lazily on first use and stay resident for the life of the
//! process; they are only released on shutdown, on explicit resource
//! pressure, or when admitting another backend would exceed the memory
//! budget. Release order is always fallback tier first, then larger
//! footprint first.
//!
//! Locking:
//! - `load_lock` (per backend) serializes `ensure_loaded` for one id, so
//!   concurrent first use loads exactly once.
//! - `admission` (global) covers the budget check, the `Loading`
//!   reservation and every release, keeping the resident set consistent
//!   with the budget. Under `SingleResident` it is also held for the whole
//!   load; under `Concurrent` the load itself runs outside it, so a slow
//!   model does not stall unrelated first loads.
//! - `in_use` (per backend) is held shared by every running generation and
//!   exclusively by release, so a runtime is never shut down mid-run.
//! - `generate_lock` (per backend) is only taken when the runtime cannot
//!   generate concurrently.
//!
//! Lock order is always `load_lock`, then `admission`, then `in_use`.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use crate::backend::{BackendAdapter, BackendHandle, ExecutionMode};
use crate::config::{BackendDescriptor, BackendKind, GenerationParams, ResidencyPolicy, Task, Tier};
use crate::error::{InferenceError, InferenceResult};
use crate::types::{GenerationResult, InferenceRequest};

/// Times `generate` re-acquires a handle released underneath it.
const GENERATE_ATTEMPTS: usize = 3;

enum SlotState {
    Unloaded,
    /// Budget reserved, runtime still loading
    Loading,
    Resident(Arc<BackendHandle>),
    /// Load failed; the backend stays disabled for the process lifetime
    Unavailable(String),
}

struct ManagedBackend {
    adapter: Arc<dyn BackendAdapter>,
    state: RwLock<SlotState>,
    load_lock: Mutex<()>,
    in_use: AsyncRwLock<()>,
    generate_lock: Mutex<()>,
    loads: AtomicU64,
    generations: AtomicU64,
}

impl ManagedBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        self.adapter.describe()
    }

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Resident handle, `None` when unloaded or loading, error when disabled.
    fn resident(&self) -> InferenceResult<Option<Arc<BackendHandle>>> {
        match &*self.state.read() {
            SlotState::Resident(handle) => Ok(Some(handle.clone())),
            SlotState::Unloaded | SlotState::Loading => Ok(None),
            SlotState::Unavailable(reason) => Err(InferenceError::BackendUnavailable {
                backend: self.id().to_string(),
                reason: reason.clone(),
            }),
        }
    }

    fn is_resident(&self) -> bool {
        matches!(&*self.state.read(), SlotState::Resident(_))
    }

    /// Whether the footprint counts against the budget.
    fn occupies_budget(&self) -> bool {
        matches!(
            &*self.state.read(),
            SlotState::Resident(_) | SlotState::Loading
        )
    }

    /// Sort key for release: fallback tier first, then larger footprint.
    fn release_rank(&self) -> (u8, Reverse<u64>) {
        let descriptor = self.descriptor();
        let tier = match descriptor.tier {
            Tier::Fallback => 0,
            Tier::Primary => 1,
        };
        (tier, Reverse(descriptor.footprint_mb))
    }
}

/// Budget reservation for one in-progress load.
///
/// Dropping it unsettled (the load future was cancelled) hands the
/// reservation back.
struct LoadReservation<'a> {
    slot: &'a ManagedBackend,
    settled: bool,
}

impl<'a> LoadReservation<'a> {
    fn new(slot: &'a ManagedBackend) -> Self {
        *slot.state.write() = SlotState::Loading;
        Self {
            slot,
            settled: false,
        }
    }

    fn settle(mut self, state: SlotState) {
        *self.slot.state.write() = state;
        self.settled = true;
    }
}

impl Drop for LoadReservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.slot.state.write();
        if matches!(&*state, SlotState::Loading) {
            *state = SlotState::Unloaded;
        }
    }
}

/// Residency state reported by [`ResourceLifecycleManager::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    Resident,
    Loading,
    Unloaded,
    Unavailable,
}

/// Diagnostic snapshot of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: BackendKind,
    pub tier: Tier,
    pub tasks: Vec<Task>,
    pub residency: Residency,
    /// Load failure that disabled the backend
    pub reason: Option<String>,
    /// Execution mode of the resident runtime
    pub mode: Option<ExecutionMode>,
    pub footprint_mb: u64,
    pub loads: u64,
    pub generations: u64,
}

pub struct ResourceLifecycleManager {
    backends: Vec<Arc<ManagedBackend>>,
    index: HashMap<String, usize>,
    policy: ResidencyPolicy,
    budget_mb: u64,
    admission: Mutex<()>,
}

impl ResourceLifecycleManager {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        policy: ResidencyPolicy,
        budget_mb: u64,
    ) -> Self {
        let backends: Vec<Arc<ManagedBackend>> = adapters
            .into_iter()
            .map(|adapter| {
                Arc::new(ManagedBackend {
                    adapter,
                    state: RwLock::new(SlotState::Unloaded),
                    load_lock: Mutex::new(()),
                    in_use: AsyncRwLock::new(()),
                    generate_lock: Mutex::new(()),
                    loads: AtomicU64::new(0),
                    generations: AtomicU64::new(0),
                })
            })
            .collect();
        let index = backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id().to_string(), i))
            .collect();

        info!(backends = backends.len(), %policy, budget_mb, "lifecycle manager ready");
        Self {
            backends,
            index,
            policy,
            budget_mb,
            admission: Mutex::new(()),
        }
    }

    fn slot(&self, backend_id: &str) -> InferenceResult<&Arc<ManagedBackend>> {
        self.index
            .get(backend_id)
            .map(|&i| &self.backends[i])
            .ok_or_else(|| InferenceError::BackendNotFound(backend_id.to_string()))
    }

    pub fn policy(&self) -> ResidencyPolicy {
        self.policy
    }

    pub fn budget_mb(&self) -> u64 {
        self.budget_mb
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    pub fn descriptor(&self, backend_id: &str) -> Option<&BackendDescriptor> {
        self.slot(backend_id).ok().map(|b| b.descriptor())
    }

    /// Load `backend_id` if it is not resident. Idempotent.
    ///
    /// A load failure disables the backend: later calls return
    /// [`InferenceError::BackendUnavailable`] without touching the artifact.
    pub async fn ensure_loaded(&self, backend_id: &str) -> InferenceResult<Arc<BackendHandle>> {
        let slot = self.slot(backend_id)?;
        if let Some(handle) = slot.resident()? {
            return Ok(handle);
        }

        let _load = slot.load_lock.lock().await;
        if let Some(handle) = slot.resident()? {
            return Ok(handle);
        }

        let admission = self.admission.lock().await;
        self.make_room(slot).await?;
        let reservation = LoadReservation::new(slot);
        let _admission = match self.policy {
            ResidencyPolicy::SingleResident => Some(admission),
            ResidencyPolicy::Concurrent => {
                drop(admission);
                None
            }
        };

        let started = Instant::now();
        match slot.adapter.load().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                reservation.settle(SlotState::Resident(handle.clone()));
                slot.loads.fetch_add(1, Ordering::Relaxed);
                info!(
                    backend = backend_id,
                    mode = %handle.mode,
                    footprint_mb = slot.descriptor().footprint_mb,
                    resident_mb = self.resident_mb(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend resident"
                );
                Ok(handle)
            }
            Err(e) => {
                if e.is_fatal_for_backend() {
                    warn!(backend = backend_id, error = %e, "backend disabled after load failure");
                    reservation.settle(SlotState::Unavailable(e.to_string()));
                } else {
                    reservation.settle(SlotState::Unloaded);
                }
                Err(e)
            }
        }
    }

    /// Free budget for `slot` according to the residency policy.
    /// Caller holds the admission lock.
    async fn make_room(&self, slot: &Arc<ManagedBackend>) -> InferenceResult<()> {
        let needed = slot.descriptor().footprint_mb;
        if needed > self.budget_mb {
            return Err(InferenceError::BudgetExceeded(format!(
                "backend '{}' needs {needed} MB, budget is {} MB",
                slot.id(),
                self.budget_mb
            )));
        }

        for victim in self.release_order() {
            if Arc::ptr_eq(&victim, slot) {
                continue;
            }
            let must_release = match self.policy {
                ResidencyPolicy::SingleResident => true,
                ResidencyPolicy::Concurrent => self.occupied_mb() + needed > self.budget_mb,
            };
            if !must_release {
                break;
            }
            debug!(backend = victim.id(), incoming = slot.id(), "releasing to admit backend");
            self.release_locked(&victim).await;
        }

        if self.occupied_mb() + needed > self.budget_mb {
            return Err(InferenceError::BudgetExceeded(format!(
                "backend '{}' needs {needed} MB, {} MB of {} MB committed",
                slot.id(),
                self.occupied_mb(),
                self.budget_mb
            )));
        }
        Ok(())
    }

    /// Resident backends in release order. Loading backends are never
    /// candidates.
    fn release_order(&self) -> Vec<Arc<ManagedBackend>> {
        let mut resident: Vec<Arc<ManagedBackend>> = self
            .backends
            .iter()
            .filter(|b| b.is_resident())
            .cloned()
            .collect();
        resident.sort_by_key(|b| b.release_rank());
        resident
    }

    /// Wait for in-flight generations to finish, then drop the handle and
    /// shut its runtime down. Caller holds the admission lock. Returns
    /// whether anything was resident.
    async fn release_locked(&self, slot: &ManagedBackend) -> bool {
        if !slot.is_resident() {
            return false;
        }
        let _idle = slot.in_use.write().await;
        let handle = {
            let mut state = slot.state.write();
            match std::mem::replace(&mut *state, SlotState::Unloaded) {
                SlotState::Resident(handle) => handle,
                other => {
                    *state = other;
                    return false;
                }
            }
        };
        slot.adapter.unload(&handle).await;
        info!(backend = slot.id(), "backend released");
        true
    }

    /// Release one backend. Idempotent; a disabled backend stays disabled.
    pub async fn release(&self, backend_id: &str) -> InferenceResult<bool> {
        let slot = self.slot(backend_id)?;
        let _admission = self.admission.lock().await;
        Ok(self.release_locked(slot).await)
    }

    /// Release every resident backend in release order. Returns the ids
    /// released, in order.
    pub async fn release_all(&self) -> Vec<String> {
        let _admission = self.admission.lock().await;
        let mut released = Vec::new();
        for slot in self.release_order() {
            if self.release_locked(&slot).await {
                released.push(slot.id().to_string());
            }
        }
        released
    }

    /// Release backends in release order until at most `target_mb` is
    /// resident. Returns the ids released, in order.
    pub async fn relieve_pressure(&self, target_mb: u64) -> Vec<String> {
        let _admission = self.admission.lock().await;
        let mut released = Vec::new();
        for slot in self.release_order() {
            if self.resident_mb() <= target_mb {
                break;
            }
            if self.release_locked(&slot).await {
                released.push(slot.id().to_string());
            }
        }
        if !released.is_empty() {
            info!(?released, target_mb, resident_mb = self.resident_mb(), "relieved memory pressure");
        }
        released
    }

    /// Run one request on `backend_id`, loading it first if needed.
    ///
    /// The handle stays resident until the call returns. If a release wins
    /// the race between load and use, the backend is loaded again.
    pub async fn generate(
        &self,
        backend_id: &str,
        request: &InferenceRequest,
        params: &GenerationParams,
    ) -> InferenceResult<GenerationResult> {
        let slot = self.slot(backend_id)?;

        for _ in 0..GENERATE_ATTEMPTS {
            let handle = self.ensure_loaded(backend_id).await?;
            let _in_use = slot.in_use.read().await;
            let current = slot.resident()?;
            if !current.is_some_and(|c| Arc::ptr_eq(&c, &handle)) {
                debug!(backend = backend_id, "handle released before use, reloading");
                continue;
            }

            let _serial = if handle.runtime.supports_concurrent_generation() {
                None
            } else {
                Some(slot.generate_lock.lock().await)
            };

            slot.generations.fetch_add(1, Ordering::Relaxed);
            return slot.adapter.generate(&handle, request, params).await;
        }

        Err(InferenceError::BudgetExceeded(format!(
            "backend '{backend_id}' kept being released before it could generate"
        )))
    }

    /// Declared footprint of all resident backends.
    pub fn resident_mb(&self) -> u64 {
        self.backends
            .iter()
            .filter(|b| b.is_resident())
            .map(|b| b.descriptor().footprint_mb)
            .sum()
    }

    /// Footprint of resident backends plus loads in progress.
    fn occupied_mb(&self) -> u64 {
        self.backends
            .iter()
            .filter(|b| b.occupies_budget())
            .map(|b| b.descriptor().footprint_mb)
            .sum()
    }

    pub fn is_resident(&self, backend_id: &str) -> bool {
        self.slot(backend_id).map(|b| b.is_resident()).unwrap_or(false)
    }

    pub fn is_unavailable(&self, backend_id: &str) -> bool {
        self.slot(backend_id)
            .map(|b| matches!(&*b.state.read(), SlotState::Unavailable(_)))
            .unwrap_or(false)
    }

    /// Number of successful loads of `backend_id` so far.
    pub fn load_count(&self, backend_id: &str) -> u64 {
        self.slot(backend_id)
            .map(|b| b.loads.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| {
                let descriptor = b.descriptor();
                let (residency, reason, mode) = match &*b.state.read() {
                    SlotState::Resident(handle) => (Residency::Resident, None, Some(handle.mode)),
                    SlotState::Loading => (Residency::Loading, None, None),
                    SlotState::Unloaded => (Residency::Unloaded, None, None),
                    SlotState::Unavailable(reason) => {
                        (Residency::Unavailable, Some(reason.clone()), None)
                    }
                };
                BackendStatus {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    version: descriptor.version.clone(),
                    kind: descriptor.kind,
                    tier: descriptor.tier,
                    tasks: descriptor.tasks.clone(),
                    residency,
                    reason,
                    mode,
                    footprint_mb: descriptor.footprint_mb,
                    loads: b.loads.load(Ordering::Relaxed),
                    generations: b.generations.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}
