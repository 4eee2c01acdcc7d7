//! Credential registry
//!
//! The credential set is fixed at process start: six named slots populated
//! from the environment. A slot missing its client id or secret is skipped
//! with a warning; the registry only fails when nothing usable remains.

use thiserror::Error;

use crate::config::Settings;

/// A complete, usable API credential. Immutable after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Error)]
#[error("no API credential slot has both a client id and a client secret")]
pub struct NoValidCredentials;

pub struct CredentialRegistry {
    slots: Vec<Slot>,
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
}

impl CredentialRegistry {
    pub fn from_settings(settings: &Settings) -> Self {
        let slots = settings
            .credentials
            .iter()
            .map(|slot| Slot {
                name: slot.name.clone(),
                client_id: slot.client_id.clone(),
                client_secret: slot.client_secret.clone(),
                redirect_uri: slot
                    .redirect_uri
                    .clone()
                    .or_else(|| settings.redirect_uri.clone()),
            })
            .collect();
        Self { slots }
    }

    /// Names of every configured slot, usable or not. Cleanup keys off
    /// this set, not the validated subset.
    pub fn configured_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    /// The usable subset, in registration order. Incomplete slots are
    /// logged and skipped; an empty result is the only hard failure.
    pub fn validate(&self) -> Result<Vec<Credential>, NoValidCredentials> {
        let mut valid = Vec::new();
        for slot in &self.slots {
            match (&slot.client_id, &slot.client_secret, &slot.redirect_uri) {
                (Some(id), Some(secret), Some(redirect)) => {
                    tracing::info!("{} credential configured", slot.name);
                    valid.push(Credential {
                        name: slot.name.clone(),
                        client_id: id.clone(),
                        client_secret: secret.clone(),
                        redirect_uri: redirect.clone(),
                    });
                }
                (None, _, _) | (_, None, _) => {
                    tracing::warn!(
                        "{} credential incomplete (missing client id or secret), skipping",
                        slot.name
                    );
                }
                (_, _, None) => {
                    tracing::warn!("{} credential has no redirect URI, skipping", slot.name);
                }
            }
        }

        if valid.is_empty() {
            return Err(NoValidCredentials);
        }
        tracing::info!("{} valid API credential(s) found", valid.len());
        Ok(valid)
    }
}
