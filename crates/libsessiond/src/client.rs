use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use sessiond_protocol::{
    AcquireDonePayload, AcquireDoneRequest, AcquireIntentPayload, AcquireIntentRequest,
    Descriptor, DescriptorApiLevel, DescriptorsPayload, EnumerateDoneRequest, Event,
    GetPathBySessionRequest, MessageEnvelope, PathInternal, PathPayload, PathPublic,
    ReleaseDoneRequest, ReleaseIntentRequest, Request, SessionId,
};

use crate::channel::SessionsChannel;
use crate::error::ClientError;

/// Typed API for one context (a tab, a CLI invocation, a worker).
pub struct SessionsClient<C> {
    channel: C,
    next_id: AtomicU64,
    caller: Option<String>,
}

impl<C: SessionsChannel> SessionsClient<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            next_id: AtomicU64::new(1),
            caller: None,
        }
    }

    /// Tag every request with a caller name for the service logs. The name is
    /// also the default `sessionOwner` of [`SessionsClient::acquire`].
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.channel.subscribe()
    }

    /// Send a request and return the raw success payload.
    pub async fn call(&self, request: Request) -> Result<Option<Value>, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut envelope = MessageEnvelope::new(&request)?.with_id(id);
        if let Some(caller) = &self.caller {
            envelope = envelope.with_caller(caller.clone());
        }

        let response = self.channel.send(envelope).await?;
        if response.id != id {
            return Err(anyhow!("response id {} does not match request id {id}", response.id).into());
        }
        response.into_result().map_err(|(code, message)| {
            debug!(id, kind = request.kind(), %code, "request rejected");
            ClientError::Rejected { code, message }
        })
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        let payload = self.call(request).await?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn handshake(&self) -> Result<(), ClientError> {
        self.call(Request::Handshake).await.map(|_| ())
    }

    pub async fn enumerate_done(
        &self,
        descriptors: Vec<DescriptorApiLevel>,
    ) -> Result<Vec<Descriptor>, ClientError> {
        let payload: DescriptorsPayload = self
            .call_typed(Request::EnumerateDone(EnumerateDoneRequest { descriptors }))
            .await?;
        Ok(payload.descriptors)
    }

    pub async fn acquire_intent(
        &self,
        path: impl Into<PathPublic>,
        previous: Option<SessionId>,
    ) -> Result<AcquireIntentPayload, ClientError> {
        self.call_typed(Request::AcquireIntent(AcquireIntentRequest {
            path: path.into(),
            previous,
        }))
        .await
    }

    /// Finish an acquire. Passing the session from the intent makes the
    /// service refuse if that intent is no longer the pending one.
    pub async fn acquire_done(
        &self,
        path: PathInternal,
        session: Option<SessionId>,
        session_owner: Option<String>,
    ) -> Result<AcquireDonePayload, ClientError> {
        self.call_typed(Request::AcquireDone(AcquireDoneRequest {
            path,
            session,
            session_owner,
        }))
        .await
    }

    /// Ask the service to start releasing `session`. Returns the transport
    /// path the caller must close before calling `release_done`.
    pub async fn release_intent(&self, session: impl Into<SessionId>) -> Result<PathInternal, ClientError> {
        let payload: PathPayload = self
            .call_typed(Request::ReleaseIntent(ReleaseIntentRequest {
                session: session.into(),
            }))
            .await?;
        Ok(payload.path)
    }

    pub async fn release_done(&self, path: PathInternal) -> Result<Vec<Descriptor>, ClientError> {
        let payload: DescriptorsPayload = self
            .call_typed(Request::ReleaseDone(ReleaseDoneRequest { path }))
            .await?;
        Ok(payload.descriptors)
    }

    pub async fn get_sessions(&self) -> Result<Vec<Descriptor>, ClientError> {
        let payload: DescriptorsPayload = self.call_typed(Request::GetSessions).await?;
        Ok(payload.descriptors)
    }

    pub async fn get_path_by_session(
        &self,
        session: impl Into<SessionId>,
    ) -> Result<PathInternal, ClientError> {
        let payload: PathPayload = self
            .call_typed(Request::GetPathBySession(GetPathBySessionRequest {
                session: session.into(),
            }))
            .await?;
        Ok(payload.path)
    }

    pub async fn dispose(&self) -> Result<(), ClientError> {
        self.call(Request::Dispose).await.map(|_| ())
    }

    /// Full acquisition: intent, then done. `owner` defaults to the caller
    /// name. Contexts that open the device in between drive the two steps
    /// themselves.
    pub async fn acquire(
        &self,
        path: impl Into<PathPublic>,
        previous: Option<SessionId>,
        owner: Option<&str>,
    ) -> Result<AcquireDonePayload, ClientError> {
        let intent = self.acquire_intent(path, previous).await?;
        let owner = owner.map(str::to_string).or_else(|| self.caller.clone());
        self.acquire_done(intent.path, Some(intent.session), owner).await
    }

    /// Full release: intent, then done. Returns the descriptor snapshot.
    pub async fn release(&self, session: impl Into<SessionId>) -> Result<Vec<Descriptor>, ClientError> {
        let path = self.release_intent(session).await?;
        self.release_done(path).await
    }
}
