//! Client projection: the predictive tier that mirrors the agent server.
//!
//! | Module       | Responsibility                                            |
//! |--------------|-----------------------------------------------------------|
//! | `stale`      | Drop push or response records that would move a run back  |
//! | `projection` | Provisional runs, reconciliation, predicted controls      |
//! | `transport`  | `AgentTransport` trait and the reqwest-backed client      |
//! | `submit`     | Optimistic submit/control/decide flows over a transport   |
//!
//! The projection applies the same status transition table as the engine
//! (`agent::lifecycle`), so a prediction and the authoritative answer agree
//! unless the server has moved on in the meantime.

pub mod projection;
pub mod stale;
pub mod submit;
pub mod transport;

pub use projection::{ClientProjection, Provisional};
pub use transport::{AgentTransport, HttpAgentClient};
