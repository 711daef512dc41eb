//! The conversation core of Cadence.
//!
//! A [`Session`] is one caller's conversation. Once bound to a transcriber,
//! an agent and a synthesizer it runs a pipeline worker that forwards caller
//! audio, turns final transcripts into agent replies and streams the
//! synthesized reply back through its [`EventStream`]. New speech while a
//! reply is playing interrupts it (barge-in).
//!
//! The [`SessionRegistry`] is the single source of truth for which sessions
//! exist. Transports create a session on connect and remove it on
//! disconnect; removal terminates the session.

pub mod error;
pub mod farewell;
pub mod outbound;
mod pipeline;
pub mod registry;
pub mod session;
pub mod settings;
pub mod stats;

pub use error::{RegistryError, SessionError};
pub use outbound::EventStream;
pub use registry::{SessionRegistry, DEFAULT_MAX_SESSIONS};
pub use session::Session;
pub use settings::PipelineSettings;
pub use stats::SessionStats;
