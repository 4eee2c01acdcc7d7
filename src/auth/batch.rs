//! Sequential batch over the validated credential registry
//!
//! One credential at a time, in registration order: the login form and
//! the operator prompt cannot be shared, and the provider rate-limits
//! concurrent authorization attempts. A fixed pause separates attempts.
//! Failures never abort the batch; the final outcome is computed from the
//! tally and mapped to the process exit code.

use std::time::Duration;

use chrono::Local;

use super::error::AuthError;
use super::flow::{CodeSource, Orchestrator, OperatorPrompt};
use super::registry::Credential;
use crate::driver::LoginDriver;
use crate::store::{validity, TokenRecord, TokenStore};

/// Pause between credentials; constant, not a backoff.
pub const INTER_CREDENTIAL_DELAY: Duration = Duration::from_secs(3);

/// Aggregate outcome of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    FullSuccess,
    PartialSuccess,
    TotalFailure,
    Interrupted,
}

impl BatchOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            BatchOutcome::FullSuccess => 0,
            BatchOutcome::PartialSuccess => 2,
            BatchOutcome::TotalFailure => 1,
            BatchOutcome::Interrupted => 130,
        }
    }
}

/// Per-credential result kept for the final report.
#[derive(Debug)]
pub struct CredentialReport {
    pub name: String,
    pub result: Result<CodeSource, AuthError>,
}

#[derive(Debug)]
pub struct BatchSummary {
    pub reports: Vec<CredentialReport>,
    /// Records acquired this run, in registration order. Returned even if
    /// persisting them failed.
    pub issued: Vec<(String, TokenRecord)>,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn outcome(&self) -> BatchOutcome {
        if self.interrupted {
            return BatchOutcome::Interrupted;
        }
        let successes = self.reports.iter().filter(|r| r.result.is_ok()).count();
        if successes == 0 {
            BatchOutcome::TotalFailure
        } else if successes == self.reports.len() {
            BatchOutcome::FullSuccess
        } else {
            BatchOutcome::PartialSuccess
        }
    }

    /// Final console summary.
    pub fn print(&self) {
        println!();
        println!("Summary:");
        for report in &self.reports {
            match &report.result {
                Ok(source) => println!("  {:<14} ok ({} login)", report.name, source),
                Err(e) => println!("  {:<14} failed: {}", report.name, e),
            }
        }
    }
}

pub struct BatchRunner<'a, D, P> {
    orchestrator: Orchestrator<D, P>,
    store: &'a TokenStore,
    delay: Duration,
}

impl<'a, D: LoginDriver, P: OperatorPrompt> BatchRunner<'a, D, P> {
    pub fn new(orchestrator: Orchestrator<D, P>, store: &'a TokenStore, delay: Duration) -> Self {
        Self {
            orchestrator,
            store,
            delay,
        }
    }

    /// Run every credential, then merge all newly acquired records into
    /// the store in one operation. A persist failure is reported but the
    /// acquired tokens are still returned.
    pub async fn run(&self, credentials: &[Credential]) -> BatchSummary {
        let mut reports = Vec::with_capacity(credentials.len());
        let mut issued: Vec<(String, TokenRecord)> = Vec::new();
        let mut interrupted = false;

        for (index, credential) in credentials.iter().enumerate() {
            println!(
                "[{}/{}] Authorizing {}...",
                index + 1,
                credentials.len(),
                credential.name
            );

            let result = tokio::select! {
                r = self.orchestrator.authorize(credential) => r,
                _ = tokio::signal::ctrl_c() => Err(AuthError::Interrupted),
            };

            match result {
                Ok(outcome) => {
                    if let Some(user) = outcome.raw.get("user_id").and_then(|v| v.as_str()) {
                        tracing::debug!("{} authorized for user {}", credential.name, user);
                    }
                    let now = Local::now().naive_local();
                    let record = TokenRecord::issue(
                        outcome.access_token,
                        credential.client_id.clone(),
                        now,
                    );
                    println!(
                        "  {} token acquired ({} login), valid until {}",
                        credential.name,
                        outcome.source,
                        validity::calculate_validity(now).format("%Y-%m-%d %H:%M:%S")
                    );
                    issued.push((credential.name.clone(), record));
                    reports.push(CredentialReport {
                        name: credential.name.clone(),
                        result: Ok(outcome.source),
                    });
                }
                Err(AuthError::Interrupted) => {
                    tracing::warn!("interrupted, abandoning remaining credentials");
                    reports.push(CredentialReport {
                        name: credential.name.clone(),
                        result: Err(AuthError::Interrupted),
                    });
                    interrupted = true;
                    // Let the driver's detached session teardown land.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    break;
                }
                Err(e) => {
                    tracing::error!("{} authorization failed: {}", credential.name, e);
                    println!("  {} failed: {}", credential.name, e);
                    reports.push(CredentialReport {
                        name: credential.name.clone(),
                        result: Err(e),
                    });
                }
            }

            if index + 1 < credentials.len() {
                tracing::debug!(
                    "waiting {}s before the next credential",
                    self.delay.as_secs()
                );
                tokio::time::sleep(self.delay).await;
            }
        }

        if !issued.is_empty() {
            let now = Local::now().naive_local();
            match self.store.merge(&issued, now) {
                Ok(_) => {
                    println!();
                    println!("Tokens saved to {}", self.store.path().display());
                }
                Err(e) => {
                    tracing::error!(
                        "tokens were acquired but the store could not be written: {}",
                        e
                    );
                }
            }
        }

        BatchSummary {
            reports,
            issued,
            interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::flow::AuthEndpoints;
    use crate::driver::{DriverError, LoginDriver, LoginSecrets};
    use std::collections::HashMap;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential(name: &str) -> Credential {
        Credential {
            name: name.to_string(),
            client_id: format!("{}-id", name.to_lowercase()),
            client_secret: format!("{}-secret", name.to_lowercase()),
            redirect_uri: "https://cb.example.com/redirect".to_string(),
        }
    }

    fn echo_redirect(authorization_url: &str) -> String {
        let url = Url::parse(authorization_url).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        format!(
            "https://cb.example.com/redirect?code=test-code&state={}",
            state
        )
    }

    /// Succeeds for listed client ids, times out for everything else.
    struct PartialDriver {
        succeeds_for: Vec<&'static str>,
    }

    impl LoginDriver for PartialDriver {
        async fn acquire(
            &self,
            authorization_url: &str,
            _secrets: &LoginSecrets,
        ) -> Result<String, DriverError> {
            let url = Url::parse(authorization_url).unwrap();
            let client_id = url
                .query_pairs()
                .find(|(k, _)| k == "client_id")
                .map(|(_, v)| v.into_owned())
                .unwrap();
            if self.succeeds_for.contains(&client_id.as_str()) {
                Ok(echo_redirect(authorization_url))
            } else {
                Err(DriverError::Timeout("redirect to cb.example.com".into()))
            }
        }
    }

    /// Echoes a valid redirect, or aborts with empty input.
    struct FixedPrompt {
        abort: bool,
    }

    impl OperatorPrompt for FixedPrompt {
        async fn read_redirect_url(
            &self,
            _credential: &str,
            authorization_url: &Url,
        ) -> Result<String, std::io::Error> {
            if self.abort {
                Ok(String::new())
            } else {
                Ok(echo_redirect(authorization_url.as_str()))
            }
        }
    }

    async fn runner_fixture(
        server: &MockServer,
        store: &TokenStore,
        succeeds_for: Vec<&'static str>,
        prompt_aborts: bool,
    ) -> BatchSummary {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
            })))
            .mount(server)
            .await;

        let endpoints = AuthEndpoints {
            authorization_url: "https://auth.example.com/dialog".to_string(),
            token_url: format!("{}/token", server.uri()),
        };
        let orchestrator = Orchestrator::new(
            endpoints,
            LoginSecrets::default(),
            PartialDriver { succeeds_for },
            FixedPrompt {
                abort: prompt_aborts,
            },
            true,
        )
        .unwrap();

        let runner = BatchRunner::new(orchestrator, store, Duration::from_millis(0));
        runner.run(&[credential("A"), credential("B")]).await
    }

    #[tokio::test]
    async fn test_automated_plus_manual_is_full_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let server = MockServer::start().await;

        // A succeeds via the driver; B's driver times out, the manual
        // fallback answers.
        let summary = runner_fixture(&server, &store, vec!["a-id"], false).await;

        assert_eq!(summary.outcome(), BatchOutcome::FullSuccess);
        assert_eq!(summary.outcome().exit_code(), 0);
        assert_eq!(
            summary.reports[0].result.as_ref().unwrap(),
            &CodeSource::Automated
        );
        assert_eq!(
            summary.reports[1].result.as_ref().unwrap(),
            &CodeSource::Manual
        );

        let doc = store.load();
        assert_eq!(doc.data.len(), 2);
        for name in ["A", "B"] {
            let record = &doc.data[name];
            let generated = record.generated_time().unwrap();
            assert_eq!(
                record.validity_time().unwrap(),
                validity::calculate_validity(generated)
            );
        }
        // Distinct generation instants, distinct pairs.
        assert_ne!(
            doc.data["A"].generated_at, doc.data["B"].generated_at,
        );
        assert_eq!(doc.metadata.total_tokens, Some(2));
        assert_eq!(
            doc.metadata.updated_apis,
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[tokio::test]
    async fn test_mixed_outcome_is_partial_and_skips_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let server = MockServer::start().await;

        // A succeeds; B fails both the driver and the (aborting) prompt.
        let summary = runner_fixture(&server, &store, vec!["a-id"], true).await;

        assert_eq!(summary.outcome(), BatchOutcome::PartialSuccess);
        assert_eq!(summary.outcome().exit_code(), 2);
        assert!(matches!(
            summary.reports[1].result,
            Err(AuthError::ManualAborted)
        ));

        let doc = store.load();
        assert_eq!(doc.data.len(), 1);
        assert!(doc.data.contains_key("A"));
    }

    #[tokio::test]
    async fn test_zero_successes_is_total_failure_with_no_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let server = MockServer::start().await;

        let summary = runner_fixture(&server, &store, vec![], true).await;

        assert_eq!(summary.outcome(), BatchOutcome::TotalFailure);
        assert_eq!(summary.outcome().exit_code(), 1);
        assert!(summary.issued.is_empty());
        // No successes: merge never ran, no file was created.
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_tokens_survive_persist_failure() {
        // Point the store at a path whose parent is a file, so persist
        // must fail while acquisition succeeds.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let store = TokenStore::new(blocker.join("tokens.json"));
        let server = MockServer::start().await;

        let summary = runner_fixture(&server, &store, vec!["a-id", "b-id"], true).await;

        assert_eq!(summary.outcome(), BatchOutcome::FullSuccess);
        assert_eq!(summary.issued.len(), 2);
    }
}
