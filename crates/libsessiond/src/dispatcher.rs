use serde::Serialize;
use serde_json::Value;

use sessiond_protocol::{Event, Request};

use crate::engine::{ArbitrationEngine, Transition};
use crate::error::SessionsError;
use crate::handler::encode_payload;

/// A request applied to the engine: the response payload and the events to
/// publish once the response is committed.
#[derive(Debug, Default)]
pub struct Routed {
    pub payload: Option<Value>,
    pub events: Vec<Event>,
}

impl Routed {
    fn from_transition<T: Serialize>(transition: Transition<T>) -> Result<Self, SessionsError> {
        Ok(Self {
            payload: encode_payload(&transition.payload)?,
            events: transition.events,
        })
    }

    fn read_only<T: Serialize>(payload: &T) -> Result<Self, SessionsError> {
        Ok(Self {
            payload: encode_payload(payload)?,
            events: Vec::new(),
        })
    }
}

/// Route a typed request to the matching engine operation.
pub fn route(engine: &mut ArbitrationEngine, request: Request) -> Result<Routed, SessionsError> {
    match request {
        Request::Handshake => Ok(Routed::default()),
        Request::EnumerateDone(req) => Routed::from_transition(engine.enumerate_done(req.descriptors)),
        Request::AcquireIntent(req) => Routed::from_transition(engine.acquire_intent(req)?),
        Request::AcquireDone(req) => Routed::from_transition(engine.acquire_done(req)?),
        Request::ReleaseIntent(req) => Routed::from_transition(engine.release_intent(req)?),
        Request::ReleaseDone(req) => Routed::from_transition(engine.release_done(req)),
        Request::GetSessions => Routed::read_only(&engine.get_sessions()),
        Request::GetPathBySession(req) => Routed::read_only(&engine.get_path_by_session(&req)?),
        Request::Dispose => Ok(Routed {
            payload: None,
            events: engine.dispose().events,
        }),
    }
}
