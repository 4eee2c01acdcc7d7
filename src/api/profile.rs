//! User profile endpoint (/v2/user/profile)
//!
//! Post-login verification only: each freshly acquired token is used to
//! fetch the account profile so the operator can see the tokens actually
//! work. Nothing here feeds back into the token lifecycle.

use anyhow::{Context, Result};
use serde::Deserialize;

const PROFILE_URL: &str = "https://api.upstox.com/v2/user/profile";

#[derive(Debug, Deserialize)]
struct ProfileEnvelope {
    status: Option<String>,
    data: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
pub struct UserProfile {
    pub email: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_type: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

/// Fetch the profile behind an access token.
pub async fn fetch_profile(access_token: &str) -> Result<UserProfile> {
    let client = reqwest::Client::new();
    let resp = client
        .get(PROFILE_URL)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .context("Profile request failed")?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("Profile request rejected (HTTP {})", status.as_u16());
    }

    let envelope: ProfileEnvelope = resp
        .json()
        .await
        .context("Failed to parse profile response")?;
    if envelope.status.as_deref() != Some("success") {
        anyhow::bail!("Profile response status was not success");
    }
    envelope.data.context("Profile response missing data")
}

/// Mask an email for display: first three characters plus the domain.
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let prefix: String = local.chars().take(3).collect();
            format!("{}***@{}", prefix, domain)
        }
        None => email.to_string(),
    }
}

/// Print one profile card.
pub fn print_profile_card(api_name: &str, profile: &UserProfile) {
    println!();
    println!("{} profile", api_name);
    println!(
        "  email:   {}",
        profile
            .email
            .as_deref()
            .map(mask_email)
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!(
        "  user id: {}",
        profile.user_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "  name:    {}",
        profile.user_name.as_deref().unwrap_or("(none)")
    );
    println!(
        "  type:    {}",
        profile.user_type.as_deref().unwrap_or("(none)")
    );
    println!(
        "  status:  {}",
        if profile.is_active { "active" } else { "inactive" }
    );
}

/// Verify each newly acquired token by fetching its profile.
pub async fn verify_profiles(tokens: &[(String, String)]) {
    if tokens.is_empty() {
        return;
    }
    println!();
    println!("Verifying account profiles...");
    for (name, access_token) in tokens {
        match fetch_profile(access_token).await {
            Ok(profile) => print_profile_card(name, &profile),
            Err(e) => {
                tracing::warn!("profile verification failed for {}: {:#}", name, e);
                println!("  {} profile could not be verified", name);
            }
        }
    }
}
