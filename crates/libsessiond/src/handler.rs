use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

use sessiond_protocol::ServerMessage;

use crate::error::SessionsError;

/// Serialize a success payload for the response envelope. A failure here
/// is the service's own fault and is reported as an internal error.
pub fn encode_payload<T: Serialize>(data: &T) -> Result<Option<Value>, SessionsError> {
    serde_json::to_value(data).map(Some).map_err(|e| {
        error!("failed to encode response payload: {e}");
        SessionsError::Internal(format!("failed to encode payload: {e}"))
    })
}

/// Try-send a line on a connection's outbound queue. Returns error if full or closed.
pub fn enqueue_message(out_tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> Result<()> {
    match out_tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}
