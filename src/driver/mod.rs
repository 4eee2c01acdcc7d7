//! Interactive login driver
//!
//! The authorization flow needs a collaborator able to complete the
//! provider's login form (mobile number, TOTP, PIN) and report the final
//! redirect URL. The flow treats it as opaque: it hands over the
//! authorization URL and the secrets, and gets back either the redirect
//! URL or a typed failure that triggers the manual fallback.

pub mod totp;
pub mod webdriver;

use thiserror::Error;

pub use webdriver::WebDriverLogin;

/// Secrets the driver needs to walk the login form. All optional at
/// configuration time; an automated attempt without the full set fails
/// over to manual entry.
#[derive(Debug, Clone, Default)]
pub struct LoginSecrets {
    pub mobile_number: Option<String>,
    pub totp_secret: Option<String>,
    pub pin: Option<String>,
}

impl LoginSecrets {
    /// All three secrets, or None if any is missing.
    pub fn complete(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.mobile_number.as_deref()?,
            self.totp_secret.as_deref()?,
            self.pin.as_deref()?,
        ))
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("login page element not found: {0}")]
    ElementNotFound(String),
    #[error("login secrets incomplete (mobile number, TOTP secret and PIN are all required)")]
    MissingSecrets,
    #[error("interactive login failed: {0}")]
    Unexpected(String),
}

/// Contract for the automated login collaborator: open `authorization_url`,
/// complete the login steps with `secrets`, return the final redirect URL.
pub trait LoginDriver {
    async fn acquire(
        &self,
        authorization_url: &str,
        secrets: &LoginSecrets,
    ) -> Result<String, DriverError>;
}
