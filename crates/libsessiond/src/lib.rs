//! Session arbitration for hardware-wallet devices shared by many contexts.
//!
//! One [`SessionsBackground`] owns the descriptor registry and the session
//! ledger; contexts talk to it through a [`SessionsChannel`], either in
//! process ([`LocalChannel`]) or over the server socket ([`SocketChannel`]).

pub mod background;
pub mod broker;
pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod registry;

pub use background::{ServiceConfig, SessionsBackground, SharedBackground};
pub use broker::EventBroadcaster;
pub use channel::{LocalChannel, SessionsChannel, SocketChannel};
pub use client::SessionsClient;
pub use engine::{ArbitrationEngine, PathState, Transition};
pub use error::{ClientError, SessionsError};
pub use handler::{encode_payload, enqueue_message};
pub use ledger::{Binding, BindingState, SessionLedger};
pub use registry::{DescriptorRegistry, EnumerationDiff, RegistryEntry};
