//! WebDriver-based login automation
//!
//! Drives the provider's hosted login form through a local WebDriver
//! server (chromedriver by default). The W3C WebDriver protocol is plain
//! HTTP+JSON, so this is a thin reqwest client: one session per attempt,
//! bounded polling waits per step, and the session is deleted on every
//! exit path.
//!
//! Login steps, in order: mobile number, request OTP, TOTP code, PIN,
//! then wait for the browser to land on the redirect host.

use std::time::{Duration, Instant, SystemTime};

use serde::Deserialize;
use serde_json::{json, Value};

use super::totp;
use super::{DriverError, LoginDriver, LoginSecrets};

/// W3C element identifier key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const MOBILE_FIELD: &str = r#"//*[@id="mobileNum"]"#;
const GET_OTP_BUTTON: &str = r#"//*[@id="getOtp"]"#;
const OTP_FIELD: &str = r#"//*[@id="otpNum"]"#;
const OTP_CONTINUE_BUTTON: &str = r#"//*[@id="continueBtn"]"#;
const PIN_FIELD: &str = r#"//*[@id="pinCode"]"#;
const PIN_CONTINUE_BUTTON: &str = r#"//*[@id="pinContinueBtn"]"#;

/// Seconds-scale per-step waits; tens of seconds for the final redirect.
const FIELD_WAIT: Duration = Duration::from_secs(30);
const BUTTON_WAIT: Duration = Duration::from_secs(10);
const REDIRECT_WAIT: Duration = Duration::from_secs(60);
const SETTLE_PAUSE: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Automated login via a WebDriver server.
pub struct WebDriverLogin {
    server_url: String,
    http: reqwest::Client,
}

impl WebDriverLogin {
    pub fn new(server_url: String) -> Self {
        Self {
            server_url,
            http: reqwest::Client::new(),
        }
    }
}

impl LoginDriver for WebDriverLogin {
    async fn acquire(
        &self,
        authorization_url: &str,
        secrets: &LoginSecrets,
    ) -> Result<String, DriverError> {
        let (mobile, totp_secret, pin) = secrets.complete().ok_or(DriverError::MissingSecrets)?;

        let redirect_host = redirect_host(authorization_url)?;

        tracing::info!("starting WebDriver session at {}", self.server_url);
        let mut session = Session::start(self.http.clone(), &self.server_url).await?;

        let result = drive_login(
            &session,
            authorization_url,
            &redirect_host,
            mobile,
            totp_secret,
            pin,
        )
        .await;

        session.quit().await;
        result
    }
}

/// Host the provider redirects back to, taken from the authorization URL's
/// redirect_uri parameter.
fn redirect_host(authorization_url: &str) -> Result<String, DriverError> {
    let parsed = url::Url::parse(authorization_url)
        .map_err(|e| DriverError::Unexpected(format!("bad authorization URL: {}", e)))?;
    let redirect_uri = parsed
        .query_pairs()
        .find(|(k, _)| k == "redirect_uri")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| {
            DriverError::Unexpected("authorization URL has no redirect_uri parameter".into())
        })?;
    url::Url::parse(&redirect_uri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| {
            DriverError::Unexpected(format!("redirect URI has no host: {}", redirect_uri))
        })
}

async fn drive_login(
    session: &Session,
    authorization_url: &str,
    redirect_host: &str,
    mobile: &str,
    totp_secret: &str,
    pin: &str,
) -> Result<String, DriverError> {
    session.navigate(authorization_url).await?;

    tracing::debug!("waiting for mobile number field");
    let field = session
        .wait_for_element(MOBILE_FIELD, "mobile number field", FIELD_WAIT)
        .await?;
    session.fill(&field, mobile).await?;

    let button = session
        .wait_for_element(GET_OTP_BUTTON, "get-OTP button", BUTTON_WAIT)
        .await?;
    session.click(&button).await?;

    // Give the provider a moment to dispatch the OTP challenge.
    tokio::time::sleep(SETTLE_PAUSE).await;

    let code = totp::generate(totp_secret, SystemTime::now())
        .map_err(|e| DriverError::Unexpected(e.to_string()))?;

    tracing::debug!("waiting for OTP field");
    let field = session
        .wait_for_element(OTP_FIELD, "OTP field", FIELD_WAIT)
        .await?;
    session.fill(&field, &code).await?;

    let button = session
        .wait_for_element(OTP_CONTINUE_BUTTON, "OTP continue button", BUTTON_WAIT)
        .await?;
    session.click(&button).await?;

    tokio::time::sleep(SETTLE_PAUSE).await;

    tracing::debug!("waiting for PIN field");
    let field = session
        .wait_for_element(PIN_FIELD, "PIN field", FIELD_WAIT)
        .await?;
    session.fill(&field, pin).await?;

    let button = session
        .wait_for_element(PIN_CONTINUE_BUTTON, "PIN continue button", BUTTON_WAIT)
        .await?;
    session.click(&button).await?;

    tracing::debug!("waiting for redirect to {}", redirect_host);
    let final_url = session
        .wait_for_redirect(redirect_host, REDIRECT_WAIT)
        .await?;
    tracing::info!("captured redirect URL from browser");
    Ok(final_url)
}

/// One WebDriver session. Deleted explicitly via `quit`; if the future is
/// cancelled mid-flight, `Drop` spawns a detached DELETE so the browser
/// never outlives the attempt.
struct Session {
    http: reqwest::Client,
    base: String,
    alive: bool,
}

#[derive(Debug, Deserialize)]
struct WireValue {
    value: Value,
}

impl Session {
    async fn start(http: reqwest::Client, server_url: &str) -> Result<Self, DriverError> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": [
                            "--disable-blink-features=AutomationControlled",
                            "--no-sandbox",
                            "--disable-dev-shm-usage",
                            "--disable-gpu",
                            "--start-maximized",
                        ],
                        "excludeSwitches": ["enable-automation"],
                    },
                },
            },
        });

        let endpoint = format!("{}/session", server_url.trim_end_matches('/'));
        let value = wire_request(http.post(&endpoint).json(&capabilities)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::Unexpected("WebDriver server returned no session id".into())
            })?;

        Ok(Self {
            base: format!(
                "{}/session/{}",
                server_url.trim_end_matches('/'),
                session_id
            ),
            http,
            alive: true,
        })
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let endpoint = format!("{}/url", self.base);
        wire_request(self.http.post(&endpoint).json(&json!({ "url": url }))).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let endpoint = format!("{}/url", self.base);
        let value = wire_request(self.http.get(&endpoint)).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Unexpected("current URL is not a string".into()))
    }

    async fn find_element(&self, xpath: &str) -> Result<Option<String>, DriverError> {
        let endpoint = format!("{}/element", self.base);
        let resp = self
            .http
            .post(&endpoint)
            .json(&json!({ "using": "xpath", "value": xpath }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body: WireValue = resp
            .json()
            .await
            .map_err(|e| DriverError::Unexpected(format!("malformed WebDriver response: {}", e)))?;

        if status.is_success() {
            let id = body
                .value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(id);
        }

        match body.value.get("error").and_then(Value::as_str) {
            Some("no such element") => Ok(None),
            Some(err) => Err(DriverError::Unexpected(format!(
                "WebDriver error: {}",
                err
            ))),
            None => Err(DriverError::Unexpected(format!(
                "WebDriver request failed (HTTP {})",
                status.as_u16()
            ))),
        }
    }

    /// Poll for an element; absence at the deadline is a timeout.
    async fn wait_for_element(
        &self,
        xpath: &str,
        description: &str,
        wait: Duration,
    ) -> Result<String, DriverError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(id) = self.find_element(xpath).await? {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(description.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_redirect(
        &self,
        redirect_host: &str,
        wait: Duration,
    ) -> Result<String, DriverError> {
        let deadline = Instant::now() + wait;
        loop {
            let current = self.current_url().await?;
            tracing::trace!("current browser URL: {}", current);
            if current.contains(redirect_host) {
                return Ok(current);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!(
                    "redirect to {}",
                    redirect_host
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fill(&self, element_id: &str, text: &str) -> Result<(), DriverError> {
        let clear = format!("{}/element/{}/clear", self.base, element_id);
        wire_request(self.http.post(&clear).json(&json!({}))).await?;
        let keys = format!("{}/element/{}/value", self.base, element_id);
        wire_request(self.http.post(&keys).json(&json!({ "text": text }))).await?;
        Ok(())
    }

    async fn click(&self, element_id: &str) -> Result<(), DriverError> {
        let endpoint = format!("{}/element/{}/click", self.base, element_id);
        wire_request(self.http.post(&endpoint).json(&json!({}))).await?;
        Ok(())
    }

    async fn quit(&mut self) {
        self.alive = false;
        if let Err(e) = self.http.delete(&self.base).send().await {
            tracing::warn!("failed to close WebDriver session: {}", e);
        } else {
            tracing::debug!("WebDriver session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        let http = self.http.clone();
        let base = self.base.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = http.delete(&base).send().await;
            });
        }
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    DriverError::Unexpected(format!("WebDriver server unreachable: {}", e))
}

async fn wire_request(request: reqwest::RequestBuilder) -> Result<Value, DriverError> {
    let resp = request.send().await.map_err(transport_error)?;
    let status = resp.status();
    let body: WireValue = resp
        .json()
        .await
        .map_err(|e| DriverError::Unexpected(format!("malformed WebDriver response: {}", e)))?;

    if !status.is_success() {
        let detail = body
            .value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let message = body
            .value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if detail == "no such element" {
            return Err(DriverError::ElementNotFound(message.to_string()));
        }
        return Err(DriverError::Unexpected(format!(
            "WebDriver error: {} {}",
            detail, message
        )));
    }
    Ok(body.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_host_from_authorization_url() {
        let url = "https://api.example.com/v2/login/authorization/dialog?\
                   client_id=abc&redirect_uri=https%3A%2F%2Fapp.example.net%2Fcallback&\
                   response_type=code&state=xyz";
        assert_eq!(redirect_host(url).unwrap(), "app.example.net");
    }

    #[test]
    fn test_redirect_host_missing_param() {
        let url = "https://api.example.com/dialog?client_id=abc";
        assert!(matches!(
            redirect_host(url),
            Err(DriverError::Unexpected(_))
        ));
    }
}
