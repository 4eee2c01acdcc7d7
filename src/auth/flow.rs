//! Per-credential authorization flow
//!
//! One credential moves through: build a CSRF-bound authorization URL,
//! acquire the redirect (automated browser login first, one manual prompt
//! as fallback), validate the returned state, exchange the code for an
//! access token. Each transition is a value the caller can inspect; a
//! failed automated attempt is a logged fallback, not an abort.

use base64::Engine;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, TokenUrl};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use super::error::{AuthError, ExchangeError};
use super::registry::Credential;
use crate::driver::{LoginDriver, LoginSecrets};

pub const AUTHORIZATION_URL: &str = "https://api.upstox.com/v2/login/authorization/dialog";
pub const TOKEN_URL: &str = "https://api.upstox.com/v2/login/authorization/token";
const GRANT_TYPE: &str = "authorization_code";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// The one authorization/token endpoint pair this tool talks to.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub authorization_url: String,
    pub token_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            authorization_url: AUTHORIZATION_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
        }
    }
}

/// A single authorization attempt: the URL to visit and the state that
/// must come back with the redirect. Discarded after the attempt.
#[derive(Debug)]
pub struct AuthorizationRequest {
    pub credential: String,
    pub issued_state: String,
    pub url: Url,
}

/// 16 bytes of OS entropy, URL-safe base64 without padding.
fn fresh_state() -> Result<String, AuthError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(AuthError::Rng)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Compose the authorization URL for a credential: client_id,
/// redirect_uri, response_type=code, and a fresh CSRF state.
pub fn authorization_request(
    credential: &Credential,
    endpoints: &AuthEndpoints,
) -> Result<AuthorizationRequest, AuthError> {
    let client = BasicClient::new(
        ClientId::new(credential.client_id.clone()),
        Some(ClientSecret::new(credential.client_secret.clone())),
        AuthUrl::new(endpoints.authorization_url.clone())?,
        Some(TokenUrl::new(endpoints.token_url.clone())?),
    )
    .set_redirect_uri(RedirectUrl::new(credential.redirect_uri.clone())?);

    let state = fresh_state()?;
    let (url, issued) = client.authorize_url(|| CsrfToken::new(state)).url();

    tracing::info!(
        "authorization URL composed for {} (redirect {})",
        credential.name,
        credential.redirect_uri
    );
    Ok(AuthorizationRequest {
        credential: credential.name.clone(),
        issued_state: issued.secret().clone(),
        url,
    })
}

/// Pull `code` and `state` out of a redirect URL's query component.
pub fn parse_redirect(redirect_url: &str) -> Result<(String, Option<String>), AuthError> {
    let parsed = Url::parse(redirect_url.trim()).map_err(AuthError::RedirectParse)?;
    let mut code = None;
    let mut state = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok((code.ok_or(AuthError::MissingCode)?, state))
}

/// How the redirect URL was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    Automated,
    Manual,
}

impl std::fmt::Display for CodeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeSource::Automated => write!(f, "automated"),
            CodeSource::Manual => write!(f, "manual"),
        }
    }
}

/// Successful end-to-end authorization of one credential.
#[derive(Debug)]
pub struct AuthOutcome {
    pub access_token: String,
    pub source: CodeSource,
    pub raw: Value,
}

/// One synchronous question to the operator: the redirect URL after they
/// complete the login themselves.
pub trait OperatorPrompt {
    async fn read_redirect_url(
        &self,
        credential: &str,
        authorization_url: &Url,
    ) -> Result<String, std::io::Error>;
}

/// Prints the authorization URL and blocks on stdin.
pub struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    async fn read_redirect_url(
        &self,
        credential: &str,
        authorization_url: &Url,
    ) -> Result<String, std::io::Error> {
        println!();
        println!(
            "Visit the following URL in your browser to authorize {}:",
            credential
        );
        println!("{}", authorization_url);
        println!();
        print!("Paste the full URL you were redirected to after login: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line)
    }
}

/// Drives one credential through the whole flow.
pub struct Orchestrator<D, P> {
    endpoints: AuthEndpoints,
    secrets: LoginSecrets,
    driver: D,
    prompt: P,
    use_automation: bool,
    http: reqwest::Client,
}

impl<D: LoginDriver, P: OperatorPrompt> Orchestrator<D, P> {
    pub fn new(
        endpoints: AuthEndpoints,
        secrets: LoginSecrets,
        driver: D,
        prompt: P,
        use_automation: bool,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;
        let http = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoints,
            secrets,
            driver,
            prompt,
            use_automation,
            http,
        })
    }

    /// Full flow for one credential. Every failure is terminal for this
    /// credential only.
    pub async fn authorize(&self, credential: &Credential) -> Result<AuthOutcome, AuthError> {
        let request = authorization_request(credential, &self.endpoints)?;
        let (redirect_url, source) = self.acquire_redirect(&request).await?;

        let (code, returned_state) = parse_redirect(&redirect_url)?;
        if returned_state.as_deref() != Some(request.issued_state.as_str()) {
            tracing::error!(
                "state mismatch for {}: redirect does not belong to this attempt",
                request.credential
            );
            return Err(AuthError::CsrfMismatch);
        }
        tracing::info!("state validated for {}", request.credential);

        let (access_token, raw) = exchange_code(&self.http, &self.endpoints, credential, &code).await?;
        Ok(AuthOutcome {
            access_token,
            source,
            raw,
        })
    }

    /// Automated attempt first; any driver failure falls back to one
    /// manual prompt. Empty operator input ends the attempt.
    async fn acquire_redirect(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<(String, CodeSource), AuthError> {
        if self.use_automation {
            tracing::info!("attempting automated login for {}", request.credential);
            match self.driver.acquire(request.url.as_str(), &self.secrets).await {
                Ok(url) => return Ok((url, CodeSource::Automated)),
                Err(e) => {
                    tracing::warn!(
                        "automated login failed for {}, falling back to manual entry: {}",
                        request.credential,
                        e
                    );
                }
            }
        }

        let pasted = self
            .prompt
            .read_redirect_url(&request.credential, &request.url)
            .await
            .map_err(AuthError::Prompt)?;
        if pasted.trim().is_empty() {
            return Err(AuthError::ManualAborted);
        }
        Ok((pasted.trim().to_string(), CodeSource::Manual))
    }
}

/// Exchange an authorization code for an access token: form POST with a
/// bounded timeout. Non-2xx or a parseable body without `access_token`
/// is a protocol error carrying the raw body.
pub async fn exchange_code(
    http: &reqwest::Client,
    endpoints: &AuthEndpoints,
    credential: &Credential,
    code: &str,
) -> Result<(String, Value), ExchangeError> {
    tracing::info!(
        "exchanging authorization code for access token ({})",
        credential.name
    );

    let params = [
        ("code", code),
        ("client_id", credential.client_id.as_str()),
        ("client_secret", credential.client_secret.as_str()),
        ("redirect_uri", credential.redirect_uri.as_str()),
        ("grant_type", GRANT_TYPE),
    ];

    let resp = http
        .post(&endpoints.token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Network(e)
            }
        })?;

    let status = resp.status();
    let body = resp.text().await.map_err(|e| {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Network(e)
        }
    })?;
    tracing::debug!("token exchange response (HTTP {}): {}", status, body);

    if !status.is_success() {
        return Err(ExchangeError::Protocol {
            status: status.as_u16(),
            body,
        });
    }

    let raw: Value = serde_json::from_str(&body).map_err(|_| ExchangeError::Protocol {
        status: status.as_u16(),
        body: body.clone(),
    })?;

    let token = raw
        .get("access_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    match token {
        Some(token) => {
            tracing::info!("access token received for {}", credential.name);
            Ok((token, raw))
        }
        None => Err(ExchangeError::Protocol {
            status: status.as_u16(),
            body,
        }),
    }
}
