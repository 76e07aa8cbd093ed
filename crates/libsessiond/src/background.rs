use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, debug_span, info, warn};

use sessiond_protocol::{ErrorCode, Event, EventKind, MessageEnvelope, ResponseEnvelope};

use crate::broker::EventBroadcaster;
use crate::dispatcher;
use crate::engine::ArbitrationEngine;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Service handle shared by every context talking to one background.
///
/// The tokio mutex is fair, so requests are applied in the order they
/// queue for it.
pub type SharedBackground = Arc<Mutex<SessionsBackground>>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Buffer of the async event channel; lagging subscribers skip beyond it.
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The sessions background service: the single arbiter of device ownership.
///
/// Requests enter through [`SessionsBackground::handle_message`], one at a
/// time; the engine is never touched from anywhere else.
pub struct SessionsBackground {
    engine: ArbitrationEngine,
    broadcaster: EventBroadcaster,
}

impl SessionsBackground {
    pub fn create(config: ServiceConfig) -> Self {
        info!(event_capacity = config.event_capacity, "sessions background created");
        Self {
            engine: ArbitrationEngine::new(),
            broadcaster: EventBroadcaster::new(config.event_capacity),
        }
    }

    /// Wrap into the shared handle used by servers and local channels.
    pub fn into_shared(self) -> SharedBackground {
        Arc::new(Mutex::new(self))
    }

    /// Parse and handle one raw JSON request line.
    pub fn handle_line(&mut self, line: &str) -> ResponseEnvelope {
        match serde_json::from_str::<MessageEnvelope>(line) {
            Ok(envelope) => self.handle_message(envelope),
            Err(err) => {
                let id = recover_id(line);
                warn!(id, "invalid request envelope: {err}");
                ResponseEnvelope::error(
                    id,
                    ErrorCode::InvalidRequest,
                    Some(format!("invalid request: {err}")),
                )
            }
        }
    }

    /// Validate, route and answer one request. Never fails: domain errors
    /// and protocol errors both come back as failure envelopes.
    pub fn handle_message(&mut self, envelope: MessageEnvelope) -> ResponseEnvelope {
        let id = envelope.correlation_id();
        let caller = envelope.caller.clone().unwrap_or_else(|| "unknown".to_string());

        let request = match envelope.to_request() {
            Ok(request) => request,
            Err(err) => {
                warn!(id, caller = %caller, kind = %envelope.kind, "malformed request: {err}");
                return ResponseEnvelope::error(
                    id,
                    ErrorCode::InvalidRequest,
                    Some(format!("invalid {} request: {err}", envelope.kind)),
                );
            }
        };

        let span = debug_span!("handle_message", id, caller = %caller, kind = request.kind());
        let _guard = span.enter();

        match dispatcher::route(&mut self.engine, request) {
            Ok(routed) => {
                for event in routed.events {
                    self.broadcaster.emit(event);
                }
                debug!("request handled");
                ResponseEnvelope::ok(id, routed.payload)
            }
            Err(err) => {
                let code = err.to_error_code();
                if code.is_domain() {
                    debug!(error = %err, "request rejected");
                    ResponseEnvelope::error(id, code, None)
                } else {
                    warn!(error = %err, "request failed");
                    ResponseEnvelope::error(id, code, Some(err.to_string()))
                }
            }
        }
    }

    /// Forcibly drop every session on service teardown. Listeners see the
    /// final events and are then detached.
    pub fn dispose(&mut self) {
        for event in self.engine.dispose().events {
            self.broadcaster.emit(event);
        }
        self.broadcaster.clear_listeners();
    }

    pub fn on<F>(&mut self, kind: EventKind, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.broadcaster.on(kind, listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcaster.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<Event> {
        self.broadcaster.sender()
    }

    pub fn engine(&self) -> &ArbitrationEngine {
        &self.engine
    }
}

impl Default for SessionsBackground {
    fn default() -> Self {
        Self::create(ServiceConfig::default())
    }
}

/// Best-effort correlation id of a line that failed envelope parsing.
fn recover_id(line: &str) -> u64 {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}
