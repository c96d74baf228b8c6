// Critical message handling: blocking alert, then one delayed forced resynchronisation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::CoordinatorEvent;
use crate::source::traits::{Message, MessageCategory};

pub trait ReloadAction: Send + Sync {
    fn reload(&self);
}

/// Default action: announce `CoordinatorEvent::Reload` to subscribers.
pub struct BroadcastReload {
    events: broadcast::Sender<CoordinatorEvent>,
}

impl BroadcastReload {
    pub fn new(events: broadcast::Sender<CoordinatorEvent>) -> Self {
        Self { events }
    }
}

impl ReloadAction for BroadcastReload {
    fn reload(&self) {
        let _ = self.events.send(CoordinatorEvent::Reload);
    }
}

pub struct CriticalAlerts {
    action: Arc<dyn ReloadAction>,
    events: broadcast::Sender<CoordinatorEvent>,
    delay: Duration,
    armed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl CriticalAlerts {
    pub fn new(
        action: Arc<dyn ReloadAction>,
        events: broadcast::Sender<CoordinatorEvent>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            action,
            events,
            delay,
            armed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Raise an alert per Critical message and arm the reload timer.
    ///
    /// While armed, further Critical messages alert but do not schedule another reload.
    /// Returns whether this call armed the timer.
    pub fn raise(&self, session_id: &str, messages: &[Message]) -> bool {
        let mut critical = messages
            .iter()
            .filter(|m| m.category == MessageCategory::Critical)
            .peekable();
        if critical.peek().is_none() {
            return false;
        }

        for message in critical {
            warn!("session {} critical: {}", session_id, message.body);
            let _ = self.events.send(CoordinatorEvent::CriticalAlert {
                session_id: session_id.to_string(),
                body: message.body.clone(),
            });
        }

        if self.armed.swap(true, Ordering::AcqRel) {
            return false;
        }

        info!(
            "session {} forced resync in {}ms",
            session_id,
            self.delay.as_millis()
        );
        let action = Arc::clone(&self.action);
        let armed = Arc::clone(&self.armed);
        let delay = self.delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => action.reload(),
                _ = shutdown.cancelled() => {}
            }
            armed.store(false, Ordering::Release);
        });
        true
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
