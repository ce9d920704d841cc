//! Payloads: the unit of work handed to the execution engine.
//!
//! A payload collects one or more requests plus the metadata the engine
//! needs to run them as a single batch. It is shared between the
//! scheduler and the engine behind an `Arc`; its *exec mutex* guards the
//! state machine, the request list and the equal-shape fingerprint. The
//! scheduler treats `Executing` and `Released` as stale states: a stale
//! payload is never extended, only replaced.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use microbatch_core::{InferenceRequest, ScheduleError};

use crate::limiter::{ModelInstance, PayloadOperation};

static NEXT_PAYLOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadState {
    /// Created, no batch committed yet
    #[default]
    Uninitialized,
    /// Batch committed, waiting for the engine
    Ready,
    /// The engine is running the batch
    Executing,
    /// The engine is done and has released its slot
    Released,
}

impl PayloadState {
    /// Stale payloads must not be extended by the scheduler
    pub fn is_stale(&self) -> bool {
        matches!(self, PayloadState::Executing | PayloadState::Released)
    }
}

/// Shape/type signature that every request in a batch must match.
///
/// Captured from the first request of a fresh batch. For each input named
/// in the enforcement map the signature pins element type and dimensions;
/// an entry with value `true` additionally requires the input to be
/// present in every batched request. When the model has optional inputs
/// the signature also pins the exact set of input names, since the engine
/// cannot batch requests that disagree on which inputs exist.
#[derive(Debug, Default)]
pub struct RequiredEqualInputs {
    initialized: bool,
    signatures: HashMap<String, InputSignature>,
    presence: Option<BTreeSet<String>>,
}

#[derive(Debug)]
struct InputSignature {
    dtype: microbatch_core::DataType,
    dims: Vec<i64>,
    required: bool,
}

impl RequiredEqualInputs {
    /// Capture the signature from the first request of a batch
    pub fn initialize(
        &mut self,
        request: &InferenceRequest,
        enforce_equal_shape: &HashMap<String, bool>,
        has_optional_inputs: bool,
    ) -> Result<(), ScheduleError> {
        self.signatures.clear();
        for (name, &required) in enforce_equal_shape {
            match request.inputs.iter().find(|t| &t.name == name) {
                Some(tensor) => {
                    self.signatures.insert(
                        name.clone(),
                        InputSignature { dtype: tensor.dtype, dims: tensor.dims.clone(), required },
                    );
                }
                None if required => {
                    self.initialized = false;
                    return Err(ScheduleError::internal(format!(
                        "request {} is missing required input '{name}'",
                        request.id()
                    )));
                }
                None => {}
            }
        }
        self.presence = has_optional_inputs
            .then(|| request.inputs.iter().map(|t| t.name.clone()).collect());
        self.initialized = true;
        Ok(())
    }

    /// Whether a signature has been captured
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Whether `request` can join the batch this signature was captured
    /// from
    pub fn has_equal_inputs(&self, request: &InferenceRequest) -> bool {
        if let Some(presence) = &self.presence {
            let names: BTreeSet<&str> = request.inputs.iter().map(|t| t.name.as_str()).collect();
            if names.len() != presence.len()
                || !presence.iter().all(|name| names.contains(name.as_str()))
            {
                return false;
            }
        }
        for (name, signature) in &self.signatures {
            match request.inputs.iter().find(|t| &t.name == name) {
                Some(tensor) => {
                    if tensor.dtype != signature.dtype || tensor.dims != signature.dims {
                        return false;
                    }
                }
                None => {
                    if signature.required {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// State behind the payload's exec mutex
pub struct PayloadInner {
    state: PayloadState,
    requests: Vec<InferenceRequest>,
    batch_size: usize,
    required_equal_inputs: RequiredEqualInputs,
    saturated: bool,
    user_state: Option<Box<dyn Any + Send>>,
    on_state_change: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl PayloadInner {
    /// Current lifecycle state
    pub fn state(&self) -> PayloadState {
        self.state
    }

    /// Set the lifecycle state without firing the state-change callback.
    /// Engine code should go through [`Payload::set_state`] instead.
    pub fn set_state(&mut self, state: PayloadState) {
        self.state = state;
    }

    /// Append a request, growing the payload's batch size
    pub fn add_request(&mut self, request: InferenceRequest) {
        self.batch_size += request.effective_batch_size();
        self.requests.push(request);
    }

    /// Size hint for an upcoming run of `add_request` calls
    pub fn reserve_requests(&mut self, additional: usize) {
        self.requests.reserve(additional);
    }

    /// Requests currently in the payload
    pub fn requests(&self) -> &[InferenceRequest] {
        &self.requests
    }

    /// Take ownership of the requests (engine side, at execution time)
    pub fn take_requests(&mut self) -> Vec<InferenceRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Sum of request batch sizes currently in the payload
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The equal-shape fingerprint for this batch
    pub fn required_equal_inputs_mut(&mut self) -> &mut RequiredEqualInputs {
        &mut self.required_equal_inputs
    }

    /// Record that this payload must not be extended further
    pub fn mark_saturated(&mut self) {
        self.saturated = true;
    }

    /// Whether the payload was marked saturated
    pub fn saturated(&self) -> bool {
        self.saturated
    }

    /// Opaque custom-batching accumulator owned by this payload
    pub fn user_state_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.user_state.as_deref_mut()
    }

    /// Install the custom-batching accumulator
    pub fn set_user_state(&mut self, state: Box<dyn Any + Send>) {
        self.user_state = Some(state);
    }

    /// Remove and return the custom-batching accumulator
    pub fn take_user_state(&mut self) -> Option<Box<dyn Any + Send>> {
        self.user_state.take()
    }
}

/// A batch of requests submitted to the execution engine as one unit
pub struct Payload {
    id: u64,
    operation: PayloadOperation,
    instance: Option<Arc<ModelInstance>>,
    inner: Mutex<PayloadInner>,
}

impl Payload {
    /// Create a fresh payload, optionally bound to a model instance
    pub fn new(operation: PayloadOperation, instance: Option<Arc<ModelInstance>>) -> Self {
        Self {
            id: NEXT_PAYLOAD_ID.fetch_add(1, Ordering::Relaxed),
            operation,
            instance,
            inner: Mutex::new(PayloadInner {
                state: PayloadState::Uninitialized,
                requests: Vec::new(),
                batch_size: 0,
                required_equal_inputs: RequiredEqualInputs::default(),
                saturated: false,
                user_state: None,
                on_state_change: None,
            }),
        }
    }

    /// Unique payload id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What the engine should do with this payload
    pub fn operation(&self) -> PayloadOperation {
        self.operation
    }

    /// Model instance this payload is bound to, if any
    pub fn instance(&self) -> Option<&Arc<ModelInstance>> {
        self.instance.as_ref()
    }

    /// Acquire the exec mutex. Must be held while observing or mutating
    /// state, the fingerprint, or the saturation flag.
    pub fn exec(&self) -> MutexGuard<'_, PayloadInner> {
        self.inner.lock()
    }

    /// Current state (briefly acquires the exec mutex)
    pub fn state(&self) -> PayloadState {
        self.inner.lock().state
    }

    /// Engine-facing state transition: sets the state and fires the
    /// state-change callback so the scheduler can re-check for a free
    /// execution slot.
    pub fn set_state(&self, state: PayloadState) {
        let callback = {
            let mut inner = self.inner.lock();
            inner.state = state;
            inner.on_state_change.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Install the state-change callback (briefly acquires the exec mutex)
    pub fn set_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().on_state_change = Some(Arc::new(callback));
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Payload")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("batch_size", &inner.batch_size)
            .field("requests", &inner.requests.len())
            .field("saturated", &inner.saturated)
            .finish()
    }
}
