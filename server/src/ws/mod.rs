//! Realtime core: envelope codec, the Hub actor and per-connection sessions.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `protocol` | Envelope schema, strict and client-frame decoding |
//! | `hub` | Single-task owner of membership, ids and fan-out |
//! | `session` | Inbound/outbound pumps bridging one WebSocket to the Hub |
//! | `handler` | `GET /ws` upgrade entry point |

pub mod handler;
pub mod hub;
pub mod protocol;
pub mod session;

pub use hub::{Hub, HubHandle, MemberInfo, SessionId};
pub use protocol::{Envelope, EnvelopeKind};
pub use session::Session;
