//! # DUPLEX Core
//!
//! Call session core of the DUPLEX peer-to-peer voice/video engine.
//!
//! This crate provides:
//! - The call session state machine and its public handle
//! - Ordered path selection with failover across direct, relay and TURN paths
//! - Authenticated, ordered signaling between the two call parties
//! - Video negotiation
//! - Byte accounting per network class
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       CallSession                                │
//! │   (caller handle: commands in, snapshots and notifications out) │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Session engine task                          │
//! │   (state machine, signaling, video, path selection)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Path tasks                                │
//! │   (open, key handshake, keep-alive over a PathTransport)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Notifications and completions are delivered on the [`CallQueue`]
//! supplied at construction, never on the engine task.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod debug_log;
pub mod descriptor;
pub mod error;
pub mod global;
pub mod link;
pub mod network;
pub mod path;
pub mod quality;
pub mod queue;
pub mod session;
pub mod signaling;
pub mod state;
pub mod stats;
pub mod transport;
pub mod video;

pub use config::{RetryConfig, ServerConfig, SessionConfig};
pub use descriptor::{ConnectionDescriptor, Credentials, EndpointKey, ProxyConfig, RelayServer};
pub use error::{CallError, Result};
pub use network::{DataSavingMode, NetworkType};
pub use path::{Candidate, PathKind, PathSelector};
pub use queue::{CallQueue, SerialQueue};
pub use session::{CallObserver, CallSession, CallSessionParams, SessionEnv, TerminationReport};
pub use signaling::{SignalingMessage, SignalingSink};
pub use state::CallState;
pub use stats::SessionStats;
pub use transport::{MediaLink, MemoryNetwork, PathTarget, PathTransport, TransportError};
pub use video::{
    CaptureError, RemoteVideoState, VideoCapturer, VideoOrientation, VideoState, VideoView,
    VideoViewFactory,
};
