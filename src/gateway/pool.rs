//! Bounded pool of request slots.
//!
//! Each in-flight request holds one slot. A slot that received a
//! rate-limited response carries a cooldown; whoever draws it next waits
//! the cooldown out before sending.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::types::GatewayError;

#[derive(Debug)]
struct Slot {
    id: usize,
    cooldown_until: Option<Instant>,
}

type SlotQueue = Arc<Mutex<VecDeque<Slot>>>;

fn lock(slots: &Mutex<VecDeque<Slot>>) -> MutexGuard<'_, VecDeque<Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct SlotPool {
    permits: Arc<Semaphore>,
    slots: SlotQueue,
    size: usize,
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let slots = (0..size)
            .map(|id| Slot {
                id,
                cooldown_until: None,
            })
            .collect();
        Self {
            permits: Arc::new(Semaphore::new(size)),
            slots: Arc::new(Mutex::new(slots)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a request.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot, then for its cooldown (if any) to pass.
    pub async fn acquire(&self) -> Result<SlotGuard, GatewayError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Network("request pool closed".to_string()))?;

        // Least recently used slot first, so cooled-down slots drift to the back.
        let slot = lock(&self.slots)
            .pop_front()
            .ok_or_else(|| GatewayError::Network("request pool exhausted".to_string()))?;

        let guard = SlotGuard {
            slot: Some(slot),
            slots: self.slots.clone(),
            _permit: permit,
        };

        if let Some(until) = guard.cooldown_until() {
            let now = Instant::now();
            if until > now {
                debug!(
                    slot = guard.id(),
                    wait_ms = (until - now).as_millis() as u64,
                    "Waiting out slot cooldown"
                );
                tokio::time::sleep_until(until).await;
            }
        }
        Ok(guard)
    }
}

/// A held slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Option<Slot>,
    slots: SlotQueue,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn id(&self) -> usize {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    fn cooldown_until(&self) -> Option<Instant> {
        self.slot.as_ref().and_then(|s| s.cooldown_until)
    }

    /// Mark this slot unusable for `duration` from now.
    pub fn cool_down(&mut self, duration: Duration) {
        if let Some(slot) = self.slot.as_mut() {
            slot.cooldown_until = Some(Instant::now() + duration);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            lock(&self.slots).push_back(slot);
        }
    }
}
