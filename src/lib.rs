//! # doubt-gate
//!
//! A quota-enforcing HTTP gateway that answers student doubts through an
//! external chat-completion service, built on [Hyper].
//!
//! Every inbound question passes through a fixed pipeline: method and
//! credential checks, payload validation, caller identification, a
//! per-caller daily quota, and finally a single call to the completion
//! service whose reply is parsed into a three-part answer.
//!
//! [Hyper]: https://hyper.rs/

pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod identity;
pub mod quota;
pub mod server;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{ChatCompletionRequest, ChatMessage, CompletionService, OpenAiClient};
pub use config::{Config, QuotaConfig, RuntimeConfig, UpstreamConfig, UpstreamSettings};
pub use error::GateError;
pub use gateway::{CompletionGateway, DoubtAnswer};
pub use handler::{AppState, ResponseBody, handle_request, respond};
pub use quota::{Admission, QuotaLedger, QuotaPolicy, Tier};
pub use validation::{DoubtRequest, ValidatedDoubt};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GateError>;
