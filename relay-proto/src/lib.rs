//! Wire protocol, frame codec, and daemon client for agent-relay.
//!
//! The daemon and the PTY wrapper both speak this protocol: length-prefixed
//! (or legacy line-delimited) JSON envelopes over a local stream socket.

pub mod client;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod frame;

pub use client::{ClientConfig, ClientEvent, ConnectionState, RelayClient, SyncReply};
pub use dedup::DedupRing;
pub use envelope::{Body, Delivery, Envelope, PayloadMeta, SyncMeta, PROTOCOL_VERSION};
pub use error::{ClientError, ErrorCode, FailureCause};
pub use frame::{encode, FrameDecoder, FrameError, Framing, DEFAULT_MAX_FRAME_BYTES};
