use std::collections::HashMap;

use tracing::debug;

use sessiond_protocol::{PathInternal, SessionId};

use crate::error::SessionsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Intent granted, waiting for the matching acquire done. The path is
    /// locked against every other intent until then.
    Acquiring,
    Owned,
    /// The owner was asked to release and is tearing the device down.
    ReleasePending,
}

/// Active path → session binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub session: SessionId,
    pub state: BindingState,
    /// Label supplied by the context that finalized the acquire.
    pub owner: Option<String>,
}

/// Result of minting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Minted {
    pub session: SessionId,
    /// Binding invalidated by this mint, if the path was owned.
    pub superseded: Option<Binding>,
}

/// Maps internal paths to session tokens, in both directions.
///
/// Both maps are updated together in every mutating call, so a token is
/// resolvable exactly as long as it is the current binding of its path.
pub struct SessionLedger {
    bindings: HashMap<PathInternal, Binding>,
    sessions: HashMap<SessionId, PathInternal>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Bind a fresh session token to `path`, invalidating any prior token.
    /// The new binding starts out [`BindingState::Acquiring`].
    pub fn mint(&mut self, path: &PathInternal) -> Minted {
        let session = uuid::Uuid::new_v4().to_string();
        let superseded = self.bindings.insert(
            path.clone(),
            Binding {
                session: session.clone(),
                state: BindingState::Acquiring,
                owner: None,
            },
        );
        if let Some(old) = &superseded {
            self.sessions.remove(&old.session);
            debug!(path = %path, superseded = %old.session, "session superseded");
        }
        self.sessions.insert(session.clone(), path.clone());
        Minted {
            session,
            superseded,
        }
    }

    /// Reverse lookup of the path a session currently owns.
    pub fn lookup(&self, session: &str) -> Result<&PathInternal, SessionsError> {
        self.sessions
            .get(session)
            .ok_or_else(|| SessionsError::SessionNotFound(session.to_string()))
    }

    /// Remove the binding for `path`.
    pub fn release(&mut self, path: &PathInternal) -> Result<Binding, SessionsError> {
        let binding = self
            .bindings
            .remove(path)
            .ok_or_else(|| SessionsError::SessionNotFound(path.to_string()))?;
        self.sessions.remove(&binding.session);
        Ok(binding)
    }

    pub fn current_owner(&self, path: &PathInternal) -> Option<&SessionId> {
        self.bindings.get(path).map(|b| &b.session)
    }

    pub fn binding(&self, path: &PathInternal) -> Option<&Binding> {
        self.bindings.get(path)
    }

    pub fn mark_release_pending(&mut self, path: &PathInternal) -> Option<&Binding> {
        let binding = self.bindings.get_mut(path)?;
        binding.state = BindingState::ReleasePending;
        Some(binding)
    }

    /// Finish a pending acquire: the binding becomes owned by `owner`.
    /// Returns `None` unless the path is in [`BindingState::Acquiring`].
    pub fn confirm(&mut self, path: &PathInternal, owner: Option<String>) -> Option<&Binding> {
        let binding = self
            .bindings
            .get_mut(path)
            .filter(|b| b.state == BindingState::Acquiring)?;
        binding.state = BindingState::Owned;
        binding.owner = owner;
        Some(binding)
    }

    /// Drop bindings whose path no longer satisfies `keep`.
    pub fn retain_paths<F>(&mut self, keep: F) -> Vec<(PathInternal, Binding)>
    where
        F: Fn(&PathInternal) -> bool,
    {
        let gone: Vec<PathInternal> = self
            .bindings
            .keys()
            .filter(|path| !keep(*path))
            .cloned()
            .collect();

        let mut dropped = Vec::with_capacity(gone.len());
        for path in gone {
            if let Ok(binding) = self.release(&path) {
                dropped.push((path, binding));
            }
        }
        dropped
    }

    /// Drop every binding. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.bindings.len();
        self.bindings.clear();
        self.sessions.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new()
    }
}
