//! Multi-account authorization for the Upstox API
//!
//! OAuth2 authorization-code flow per configured credential: CSRF-bound
//! URL, automated browser login with a single manual fallback, code
//! exchange, and a sequential batch that feeds the token store.

pub mod batch;
pub mod error;
pub mod flow;
pub mod registry;

pub use batch::{BatchOutcome, BatchRunner, BatchSummary};
pub use error::{AuthError, ExchangeError};
pub use flow::{AuthEndpoints, CodeSource, Orchestrator, StdinPrompt};
pub use registry::{Credential, CredentialRegistry};
