use tracing::{debug, info};

use sessiond_protocol::{
    AcquireDonePayload, AcquireDoneRequest, AcquireIntentPayload, AcquireIntentRequest,
    Descriptor, DescriptorApiLevel, DescriptorsPayload, Event, GetPathBySessionRequest,
    PathPayload, PathPublic, ReleaseDoneRequest, ReleaseIntentRequest, SessionId,
};

use crate::error::SessionsError;
use crate::ledger::{BindingState, SessionLedger};
use crate::registry::DescriptorRegistry;

/// Ownership state of a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    Unowned,
    /// Intent granted, acquire done not yet received.
    Acquiring(SessionId),
    Owned(SessionId),
    ReleasePending(SessionId),
}

/// Outcome of a state transition: the caller-facing payload plus the events
/// the transition must broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
    pub payload: T,
    pub events: Vec<Event>,
}

impl<T> Transition<T> {
    fn quiet(payload: T) -> Self {
        Self {
            payload,
            events: Vec::new(),
        }
    }
}

/// Per-path state machine enforcing at most one owner per device.
///
/// Transitions are synchronous; the caller serializes calls so every
/// request observes the state left by the previous one.
pub struct ArbitrationEngine {
    registry: DescriptorRegistry,
    ledger: SessionLedger,
}

impl ArbitrationEngine {
    pub fn new() -> Self {
        Self {
            registry: DescriptorRegistry::new(),
            ledger: SessionLedger::new(),
        }
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    /// Current descriptor snapshot with ownership overlaid.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.registry
            .entries()
            .iter()
            .map(|entry| entry.to_descriptor(self.ledger.binding(&entry.internal)))
            .collect()
    }

    /// State of a public path, or `None` if it is not enumerated.
    pub fn path_state(&self, path: &PathPublic) -> Option<PathState> {
        let entry = self.registry.resolve_public(path)?;
        Some(match self.ledger.binding(&entry.internal) {
            None => PathState::Unowned,
            Some(b) => match b.state {
                BindingState::Acquiring => PathState::Acquiring(b.session.clone()),
                BindingState::Owned => PathState::Owned(b.session.clone()),
                BindingState::ReleasePending => PathState::ReleasePending(b.session.clone()),
            },
        })
    }

    fn snapshot_event(&self) -> Event {
        Event::Descriptors(self.descriptors())
    }

    /// Replace the device set with a fresh enumeration. Bindings of devices
    /// that disappeared are dropped.
    pub fn enumerate_done(
        &mut self,
        descriptors: Vec<DescriptorApiLevel>,
    ) -> Transition<DescriptorsPayload> {
        let diff = self.registry.set_descriptors(descriptors);
        let registry = &self.registry;
        let dropped = self.ledger.retain_paths(|path| registry.contains(path));
        for (path, binding) in &dropped {
            info!(path = %path, session = %binding.session, "device disconnected, session dropped");
        }
        debug!(
            devices = self.registry.len(),
            connected = diff.connected.len(),
            disconnected = diff.disconnected.len(),
            "enumeration applied"
        );

        let descriptors = self.descriptors();
        Transition {
            events: vec![Event::Descriptors(descriptors.clone())],
            payload: DescriptorsPayload { descriptors },
        }
    }

    /// Claim a path. Succeeds on an unowned path or when `previous` names the
    /// current owner (hand-off); otherwise the current owner is kept.
    ///
    /// A path between intent and done, or pending release, is locked: every
    /// intent is refused until that pair completes.
    pub fn acquire_intent(
        &mut self,
        request: AcquireIntentRequest,
    ) -> Result<Transition<AcquireIntentPayload>, SessionsError> {
        let entry = self
            .registry
            .resolve_public(&request.path)
            .ok_or_else(|| SessionsError::unknown_public(&request.path))?;
        let internal = entry.internal.clone();

        let release_request = match self.ledger.binding(&internal) {
            None => None,
            Some(current) if current.state != BindingState::Owned => {
                debug!(
                    path = %request.path,
                    current = %current.session,
                    state = ?current.state,
                    "acquire rejected, path locked"
                );
                return Err(SessionsError::SessionWrongPrevious { path: request.path });
            }
            Some(current) if request.previous.as_deref() == Some(current.session.as_str()) => {
                Some(entry.to_descriptor(Some(current)))
            }
            Some(current) => {
                debug!(
                    path = %request.path,
                    current = %current.session,
                    previous = ?request.previous,
                    "acquire rejected, path owned by another session"
                );
                return Err(SessionsError::SessionWrongPrevious { path: request.path });
            }
        };

        let minted = self.ledger.mint(&internal);
        info!(
            path = %request.path,
            session = %minted.session,
            handoff = minted.superseded.is_some(),
            "acquire intent"
        );

        let mut events = Vec::with_capacity(2);
        if let Some(descriptor) = &release_request {
            events.push(Event::ReleaseRequest(descriptor.clone()));
        }
        events.push(self.snapshot_event());

        Ok(Transition {
            payload: AcquireIntentPayload {
                session: minted.session,
                path: internal,
                release_request,
            },
            events,
        })
    }

    /// Finalize an acquire after the caller claimed the physical device.
    ///
    /// Only a pending intent is finalized, and only the one named by
    /// `request.session` when given. A path nobody is acquiring gets a fresh
    /// session.
    pub fn acquire_done(
        &mut self,
        request: AcquireDoneRequest,
    ) -> Result<Transition<AcquireDonePayload>, SessionsError> {
        let Some(entry) = self.registry.resolve_internal(&request.path) else {
            debug!(path = %request.path, "acquire done for vanished device");
            return Err(SessionsError::unknown_internal(&request.path));
        };

        let session = match self.ledger.binding(&request.path) {
            None => self.ledger.mint(&request.path).session,
            Some(pending)
                if pending.state == BindingState::Acquiring
                    && request.session.as_ref().is_none_or(|s| *s == pending.session) =>
            {
                pending.session.clone()
            }
            Some(current) => {
                debug!(
                    path = %request.path,
                    current = %current.session,
                    state = ?current.state,
                    expected = ?request.session,
                    "acquire done rejected, no matching pending intent"
                );
                return Err(SessionsError::SessionWrongPrevious {
                    path: entry.public.clone(),
                });
            }
        };
        self.ledger.confirm(&request.path, request.session_owner);
        info!(path = %request.path, session = %session, "acquire done");

        let descriptors = self.descriptors();
        Ok(Transition {
            events: vec![Event::Descriptors(descriptors.clone())],
            payload: AcquireDonePayload {
                session,
                descriptors,
            },
        })
    }

    /// Mark the session's path as pending release and ask its owner to let go.
    pub fn release_intent(
        &mut self,
        request: ReleaseIntentRequest,
    ) -> Result<Transition<PathPayload>, SessionsError> {
        let path = self.ledger.lookup(&request.session)?.clone();
        self.ledger.mark_release_pending(&path);
        info!(path = %path, session = %request.session, "release intent");

        let events = self
            .registry
            .resolve_internal(&path)
            .map(|entry| Event::ReleaseRequest(entry.to_descriptor(self.ledger.binding(&path))))
            .into_iter()
            .collect();

        Ok(Transition {
            payload: PathPayload { path },
            events,
        })
    }

    /// Return the path to unowned. Releasing an unowned path is a no-op, and
    /// so is releasing a path whose acquire is still pending: that session
    /// leaves through its own release intent.
    pub fn release_done(&mut self, request: ReleaseDoneRequest) -> Transition<DescriptorsPayload> {
        let pending = self
            .ledger
            .binding(&request.path)
            .is_some_and(|b| b.state == BindingState::Acquiring);
        if pending {
            debug!(path = %request.path, "release done ignored, acquire pending");
            return Transition::quiet(DescriptorsPayload {
                descriptors: self.descriptors(),
            });
        }

        match self.ledger.release(&request.path) {
            Ok(binding) => {
                info!(path = %request.path, session = %binding.session, "release done");
                let descriptors = self.descriptors();
                Transition {
                    events: vec![Event::Descriptors(descriptors.clone())],
                    payload: DescriptorsPayload { descriptors },
                }
            }
            Err(_) => {
                debug!(path = %request.path, "release done on unowned path");
                Transition::quiet(DescriptorsPayload {
                    descriptors: self.descriptors(),
                })
            }
        }
    }

    pub fn get_sessions(&self) -> DescriptorsPayload {
        DescriptorsPayload {
            descriptors: self.descriptors(),
        }
    }

    pub fn get_path_by_session(
        &self,
        request: &GetPathBySessionRequest,
    ) -> Result<PathPayload, SessionsError> {
        let path = self.ledger.lookup(&request.session)?.clone();
        Ok(PathPayload { path })
    }

    /// Forcibly drop every session. The device snapshot is kept, so
    /// `get_sessions` keeps listing enumerated devices, all unowned.
    pub fn dispose(&mut self) -> Transition<()> {
        let dropped = self.ledger.clear();
        if dropped == 0 {
            return Transition::quiet(());
        }
        info!(dropped, "all sessions disposed");
        Transition {
            payload: (),
            events: vec![self.snapshot_event()],
        }
    }
}

impl Default for ArbitrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiond_protocol::{EventKind, PathInternal};

    fn engine_with(paths: &[&str]) -> ArbitrationEngine {
        let mut engine = ArbitrationEngine::new();
        engine.enumerate_done(paths.iter().map(|p| DescriptorApiLevel::new(*p)).collect());
        engine
    }

    fn intent(path: &str, previous: Option<&str>) -> AcquireIntentRequest {
        AcquireIntentRequest {
            path: PathPublic::from(path),
            previous: previous.map(str::to_string),
        }
    }

    fn done(path: &str, session: Option<&str>, owner: Option<&str>) -> AcquireDoneRequest {
        AcquireDoneRequest {
            path: PathInternal::from(path),
            session: session.map(str::to_string),
            session_owner: owner.map(str::to_string),
        }
    }

    /// Intent followed by the matching done; returns the owned session.
    fn acquire(engine: &mut ArbitrationEngine, path: &str, previous: Option<&str>) -> SessionId {
        let granted = engine.acquire_intent(intent(path, previous)).unwrap().payload;
        engine
            .acquire_done(done(granted.path.as_str(), Some(granted.session.as_str()), None))
            .unwrap()
            .payload
            .session
    }

    fn owners(engine: &ArbitrationEngine, path: &str) -> usize {
        engine
            .descriptors()
            .iter()
            .filter(|d| d.path.as_str() == path && d.session.is_some())
            .count()
    }

    #[test]
    fn acquire_unowned_path() {
        let mut engine = engine_with(&["1", "2"]);
        let t = engine.acquire_intent(intent("1", None)).unwrap();

        assert_eq!(t.payload.path, PathInternal::from("1"));
        assert!(t.payload.release_request.is_none());
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::Acquiring(t.payload.session.clone()))
        );
        assert_eq!(engine.path_state(&PathPublic::from("2")), Some(PathState::Unowned));
        assert_eq!(t.events.len(), 1);
        assert_eq!(t.events[0].kind(), EventKind::Descriptors);

        engine
            .acquire_done(done("1", Some(t.payload.session.as_str()), None))
            .unwrap();
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::Owned(t.payload.session))
        );
    }

    #[test]
    fn unknown_descriptor_is_rejected() {
        let mut engine = engine_with(&["1"]);
        let err = engine.acquire_intent(intent("9", None)).unwrap_err();
        assert!(matches!(err, SessionsError::DescriptorNotFound(_)));
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn owned_path_without_previous_is_rejected() {
        let mut engine = engine_with(&["1"]);
        let first = engine.acquire_intent(intent("1", None)).unwrap().payload;

        let err = engine.acquire_intent(intent("1", None)).unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::Acquiring(first.session))
        );
    }

    #[test]
    fn wrong_previous_leaves_ownership_unchanged() {
        let mut engine = engine_with(&["1"]);
        let first = engine.acquire_intent(intent("1", None)).unwrap().payload;

        let err = engine
            .acquire_intent(intent("1", Some("not-the-owner")))
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));
        assert_eq!(
            engine.ledger().current_owner(&PathInternal::from("1")),
            Some(&first.session)
        );
    }

    #[test]
    fn handoff_invalidates_previous_session() {
        let mut engine = engine_with(&["1"]);
        let first = acquire(&mut engine, "1", None);

        let t = engine
            .acquire_intent(intent("1", Some(first.as_str())))
            .unwrap();
        assert_ne!(t.payload.session, first);

        let release_request = t.payload.release_request.as_ref().unwrap();
        assert_eq!(release_request.session.as_deref(), Some(first.as_str()));
        assert_eq!(t.events[0], Event::ReleaseRequest(release_request.clone()));

        let err = engine
            .get_path_by_session(&GetPathBySessionRequest { session: first })
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionNotFound(_)));
        // The new session is published once its acquire is done.
        assert_eq!(owners(&engine, "1"), 0);
        engine
            .acquire_done(done("1", Some(t.payload.session.as_str()), None))
            .unwrap();
        assert_eq!(owners(&engine, "1"), 1);
    }

    #[test]
    fn at_most_one_owner_across_competing_intents() {
        let mut engine = engine_with(&["1"]);
        let mut granted = Vec::new();
        let mut last: Option<String> = None;

        for round in 0..20 {
            // Alternate between a stale claim and a proper hand-off.
            let previous = if round % 3 == 0 { Some("stale".to_string()) } else { last.clone() };
            if let Ok(t) = engine.acquire_intent(AcquireIntentRequest {
                path: PathPublic::from("1"),
                previous,
            }) {
                // A second intent inside the window is always refused.
                assert!(engine.acquire_intent(intent("1", Some(t.payload.session.as_str()))).is_err());
                engine
                    .acquire_done(done("1", Some(t.payload.session.as_str()), None))
                    .unwrap();
                granted.push(t.payload.session.clone());
                last = Some(t.payload.session);
            }
            assert!(owners(&engine, "1") <= 1);
        }

        assert!(!granted.is_empty());
        let valid: Vec<_> = granted
            .iter()
            .filter(|s| engine.ledger().lookup(s).is_ok())
            .collect();
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn acquire_done_returns_session_and_owner() {
        let mut engine = engine_with(&["1"]);
        let intent_payload = engine.acquire_intent(intent("1", None)).unwrap().payload;

        let finished = engine
            .acquire_done(done(
                intent_payload.path.as_str(),
                Some(intent_payload.session.as_str()),
                Some("tab-a"),
            ))
            .unwrap()
            .payload;
        assert_eq!(finished.session, intent_payload.session);
        assert_eq!(finished.descriptors[0].session.as_deref(), Some(finished.session.as_str()));
        assert_eq!(finished.descriptors[0].session_owner.as_deref(), Some("tab-a"));
    }

    #[test]
    fn acquire_done_after_unplug_fails() {
        let mut engine = engine_with(&["1"]);
        let intent_payload = engine.acquire_intent(intent("1", None)).unwrap().payload;
        engine.enumerate_done(vec![]);

        let err = engine
            .acquire_done(done(intent_payload.path.as_str(), None, None))
            .unwrap_err();
        assert!(matches!(err, SessionsError::DescriptorNotFound(_)));
        assert!(engine.ledger().lookup(&intent_payload.session).is_err());
    }

    #[test]
    fn acquire_done_without_intent_mints() {
        let mut engine = engine_with(&["1"]);
        let finished = engine.acquire_done(done("1", None, None)).unwrap().payload;
        assert_eq!(
            engine.ledger().lookup(&finished.session).unwrap(),
            &PathInternal::from("1")
        );
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::Owned(finished.session))
        );
    }

    #[test]
    fn release_intent_marks_pending_and_requests_release() {
        let mut engine = engine_with(&["1"]);
        let session = engine.acquire_intent(intent("1", None)).unwrap().payload.session;

        let t = engine
            .release_intent(ReleaseIntentRequest {
                session: session.clone(),
            })
            .unwrap();
        assert_eq!(t.payload.path, PathInternal::from("1"));
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::ReleasePending(session))
        );
        assert_eq!(t.events.len(), 1);
        assert_eq!(t.events[0].kind(), EventKind::ReleaseRequest);
    }

    #[test]
    fn release_intent_unknown_session() {
        let mut engine = engine_with(&["1"]);
        let err = engine
            .release_intent(ReleaseIntentRequest {
                session: "nope".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionNotFound(_)));
    }

    #[test]
    fn release_done_is_idempotent() {
        let mut engine = engine_with(&["1"]);
        acquire(&mut engine, "1", None);
        let path = PathInternal::from("1");

        let first = engine.release_done(ReleaseDoneRequest { path: path.clone() });
        assert_eq!(first.events.len(), 1);
        let second = engine.release_done(ReleaseDoneRequest { path });
        assert!(second.events.is_empty());

        assert_eq!(engine.path_state(&PathPublic::from("1")), Some(PathState::Unowned));
        assert!(second.payload.descriptors.iter().all(|d| d.session.is_none()));
    }

    #[test]
    fn pending_intent_locks_path_until_done() {
        let mut engine = engine_with(&["1"]);
        let t = engine.acquire_intent(intent("1", None)).unwrap();
        let first = t.payload.session.clone();

        // Nothing published yet, so nobody can learn the token to hand off.
        match &t.events[0] {
            Event::Descriptors(snapshot) => assert!(snapshot[0].session.is_none()),
            other => panic!("expected descriptors, got {other:?}"),
        }
        let err = engine
            .acquire_intent(intent("1", Some(first.as_str())))
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));

        let finished = engine
            .acquire_done(done("1", Some(first.as_str()), Some("tab-a")))
            .unwrap()
            .payload;
        assert_eq!(finished.session, first);

        let second = acquire(&mut engine, "1", Some(first.as_str()));
        assert_ne!(second, first);
        assert_eq!(owners(&engine, "1"), 1);
    }

    #[test]
    fn stale_done_cannot_finish_another_intent() {
        let mut engine = engine_with(&["1"]);
        let first = acquire(&mut engine, "1", None);
        let handoff = engine
            .acquire_intent(intent("1", Some(first.as_str())))
            .unwrap()
            .payload;

        let err = engine
            .acquire_done(done("1", Some(first.as_str()), Some("tab-a")))
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));
        assert_eq!(
            engine.path_state(&PathPublic::from("1")),
            Some(PathState::Acquiring(handoff.session.clone()))
        );

        let finished = engine
            .acquire_done(done("1", Some(handoff.session.as_str()), Some("tab-b")))
            .unwrap()
            .payload;
        assert_eq!(finished.session, handoff.session);
        assert_eq!(finished.descriptors[0].session_owner.as_deref(), Some("tab-b"));

        // A repeated done on an owned path does not hand its token out again.
        let err = engine.acquire_done(done("1", None, Some("tab-a"))).unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));
        assert_eq!(
            engine.get_sessions().descriptors[0].session_owner.as_deref(),
            Some("tab-b")
        );
    }

    #[test]
    fn release_pending_path_refuses_handoff() {
        let mut engine = engine_with(&["1"]);
        let first = acquire(&mut engine, "1", None);
        let path = engine
            .release_intent(ReleaseIntentRequest {
                session: first.clone(),
            })
            .unwrap()
            .payload
            .path;

        let err = engine
            .acquire_intent(intent("1", Some(first.as_str())))
            .unwrap_err();
        assert!(matches!(err, SessionsError::SessionWrongPrevious { .. }));

        engine.release_done(ReleaseDoneRequest { path });
        assert_eq!(engine.path_state(&PathPublic::from("1")), Some(PathState::Unowned));
        let second = acquire(&mut engine, "1", None);
        assert_eq!(
            engine.ledger().lookup(&second).unwrap(),
            &PathInternal::from("1")
        );
    }

    #[test]
    fn late_release_done_leaves_new_acquire_alone() {
        let mut engine = engine_with(&["1"]);
        let first = acquire(&mut engine, "1", None);
        let path = engine
            .release_intent(ReleaseIntentRequest { session: first })
            .unwrap()
            .payload
            .path;
        engine.release_done(ReleaseDoneRequest { path: path.clone() });

        let next = engine.acquire_intent(intent("1", None)).unwrap().payload;
        let repeated = engine.release_done(ReleaseDoneRequest { path });
        assert!(repeated.events.is_empty());
        assert_eq!(
            engine.ledger().lookup(&next.session).unwrap(),
            &PathInternal::from("1")
        );

        let finished = engine
            .acquire_done(done("1", Some(next.session.as_str()), None))
            .unwrap()
            .payload;
        assert_eq!(finished.session, next.session);
    }

    #[test]
    fn dispose_clears_every_session() {
        let mut engine = engine_with(&["1", "2"]);
        let a = engine.acquire_intent(intent("1", None)).unwrap().payload.session;
        let b = engine.acquire_intent(intent("2", None)).unwrap().payload.session;

        let t = engine.dispose();
        assert_eq!(t.events.len(), 1);

        let snapshot = engine.get_sessions().descriptors;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|d| d.session.is_none()));
        for session in [a, b] {
            assert!(engine
                .get_path_by_session(&GetPathBySessionRequest { session })
                .is_err());
        }
        assert!(engine.dispose().events.is_empty());
    }
}
