//! Error taxonomy for the authorization flow
//!
//! Every variant is terminal for a single credential only; the batch
//! continues past all of them and tallies the outcome at the end.

use thiserror::Error;

/// Token-exchange failure classes. `Protocol` retains the raw response
/// body for the logs.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("token exchange timed out")]
    Timeout,
    #[error("token exchange transport failure: {0}")]
    Network(#[source] reqwest::Error),
    #[error("token endpoint rejected the exchange (HTTP {status}): {body}")]
    Protocol { status: u16, body: String },
}

/// Per-credential authorization failure.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid authorization endpoint or redirect URI: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("could not generate CSRF state: {0}")]
    Rng(#[source] getrandom::Error),
    #[error("redirect URL could not be parsed: {0}")]
    RedirectParse(#[source] url::ParseError),
    #[error("redirect URL carries no authorization code")]
    MissingCode,
    #[error("redirect state does not match the issued state (possible CSRF)")]
    CsrfMismatch,
    #[error("manual login aborted: no redirect URL supplied")]
    ManualAborted,
    #[error("failed to read operator input: {0}")]
    Prompt(#[source] std::io::Error),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("interrupted")]
    Interrupted,
}
