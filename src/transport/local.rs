//! In-process transport with per-target fault injection.

use super::{RequestHandler, Transport};
use crate::error::{CoreError, Result};
use crate::types::EntityId;
use crate::wire::{decode_frame, encode_frame, Request, Response};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct Fault {
    /// Calls left to fail transiently.
    fail_next: u32,
    unreachable: bool,
    /// Fail every call non-transiently with this reason.
    reject: Option<String>,
}

/// Routes requests to handlers bound in this process.
///
/// Every request and response goes through the frame codec, so handlers see
/// exactly what a remote peer would. Unknown targets fail transiently, the way
/// an instance that is still activating would.
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    faults: Mutex<HashMap<String, Fault>>,
    calls: Mutex<HashMap<String, u64>>,
}

impl LocalTransport {
    /// Transport with no routes and no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to the entity URI of `id`, replacing any earlier binding.
    pub fn bind(&self, id: &EntityId, handler: Arc<dyn RequestHandler>) {
        debug!(target_uri = %id, "binding handler");
        self.routes.write().insert(id.entity_uri().to_string(), handler);
    }

    /// Remove the route of `id`. Returns whether one existed.
    pub fn unbind(&self, id: &EntityId) -> bool {
        self.routes.write().remove(id.entity_uri()).is_some()
    }

    /// Whether calls to `id` have a handler.
    pub fn is_bound(&self, id: &EntityId) -> bool {
        self.routes.read().contains_key(id.entity_uri())
    }

    /// Fail the next `count` calls to `id` with a transient error.
    pub fn fail_next(&self, id: &EntityId, count: u32) {
        self.faults
            .lock()
            .entry(id.entity_uri().to_string())
            .or_default()
            .fail_next = count;
    }

    /// Fail every call to `id` transiently until cleared.
    pub fn set_unreachable(&self, id: &EntityId, unreachable: bool) {
        self.faults
            .lock()
            .entry(id.entity_uri().to_string())
            .or_default()
            .unreachable = unreachable;
    }

    /// Fail every call to `id` with a non-transient remote error.
    pub fn reject(&self, id: &EntityId, reason: impl Into<String>) {
        self.faults
            .lock()
            .entry(id.entity_uri().to_string())
            .or_default()
            .reject = Some(reason.into());
    }

    /// Remove every injected fault for `id`.
    pub fn clear_faults(&self, id: &EntityId) {
        self.faults.lock().remove(id.entity_uri());
    }

    /// Attempts made against `id`, including failed ones.
    pub fn call_count(&self, id: &EntityId) -> u64 {
        self.calls.lock().get(id.entity_uri()).copied().unwrap_or(0)
    }

    /// Zero every per-target call counter.
    pub fn reset_call_counts(&self) {
        self.calls.lock().clear();
    }

    fn injected_fault(&self, uri: &str) -> Option<CoreError> {
        let mut faults = self.faults.lock();
        let fault = faults.get_mut(uri)?;
        if let Some(reason) = &fault.reject {
            return Some(CoreError::Remote(format!("{} rejected call: {}", uri, reason)));
        }
        if fault.unreachable {
            return Some(CoreError::Transient(format!("{} is unreachable", uri)));
        }
        if fault.fail_next > 0 {
            fault.fail_next -= 1;
            return Some(CoreError::Transient(format!("injected failure calling {}", uri)));
        }
        None
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, target: &EntityId, request: Request) -> Result<Response> {
        let uri = target.entity_uri();
        *self.calls.lock().entry(uri.to_string()).or_insert(0) += 1;
        trace!(target_uri = %uri, op = request.name(), "send");

        if let Some(err) = self.injected_fault(uri) {
            return Err(err);
        }

        let handler = self
            .routes
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| CoreError::Transient(format!("no route to {}", uri)))?;

        let request: Request = decode_frame(&encode_frame(&request)?)?;
        let response = handler.handle(request).await?;
        decode_frame(&encode_frame(&response)?)
    }
}
