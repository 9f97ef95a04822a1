//! Backend configuration validation
//!
//! After a patch is written, the backend itself is asked whether the saved
//! configuration still loads. The home automation supervisor exposes this
//! as `POST /core/api/config/core/check_config`.

use std::future::Future;
use std::time::Duration;

use homeport_shared::error::ConfigError;
use serde::Deserialize;
use tracing::debug;

/// Result of a successful validation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// No validator available; the patch is kept unchecked
    Skipped(String),
}

/// Something that can judge the saved configuration
pub trait ConfigValidator: Send + Sync {
    /// `Err(ValidationRejected)` when the configuration is invalid,
    /// `Err(ValidatorUnreachable)` when no verdict could be obtained.
    fn validate(&self) -> impl Future<Output = Result<Validation, ConfigError>> + Send;
}

/// Default supervisor endpoint for configuration checks
pub const DEFAULT_CHECK_URL: &str = "http://supervisor/core/api/config/core/check_config";

#[derive(Debug, Deserialize)]
struct CheckConfigResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

/// Validator backed by the supervisor's check_config API
#[derive(Debug, Clone)]
pub struct SupervisorValidator {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SupervisorValidator {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::ValidatorUnreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

impl ConfigValidator for SupervisorValidator {
    async fn validate(&self) -> Result<Validation, ConfigError> {
        let Some(token) = &self.token else {
            return Ok(Validation::Skipped("no supervisor token".to_string()));
        };

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| ConfigError::ValidatorUnreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConfigError::ValidatorUnreachable(format!("HTTP {}: {}", status, body)));
        }

        let check: CheckConfigResponse = resp
            .json()
            .await
            .map_err(|e| ConfigError::ValidatorUnreachable(format!("unreadable response: {}", e)))?;
        debug!(?check, "check_config answered");
        interpret(check)
    }
}

fn interpret(check: CheckConfigResponse) -> Result<Validation, ConfigError> {
    let errors = check.errors.filter(|e| !e.is_null());
    match (check.result.as_deref(), errors) {
        (Some("invalid"), errors) => Err(ConfigError::ValidationRejected(
            errors.map(|e| e.to_string()).unwrap_or_else(|| "invalid".to_string()),
        )),
        (_, Some(errors)) => Err(ConfigError::ValidationRejected(errors.to_string())),
        _ => Ok(Validation::Valid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Validation, ConfigError> {
        interpret(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_valid() {
        assert_eq!(parse(r#"{"result":"valid","errors":null}"#).unwrap(), Validation::Valid);
        assert_eq!(parse(r#"{"result":"valid"}"#).unwrap(), Validation::Valid);
    }

    #[test]
    fn test_invalid() {
        let err = parse(r#"{"result":"invalid","errors":"Integration error: http"}"#).unwrap_err();
        match err {
            ConfigError::ValidationRejected(msg) => assert!(msg.contains("Integration error")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            parse(r#"{"result":"invalid"}"#),
            Err(ConfigError::ValidationRejected(_))
        ));
    }

    #[test]
    fn test_errors_without_result() {
        assert!(matches!(
            parse(r#"{"errors":["bad key"]}"#),
            Err(ConfigError::ValidationRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_skipped_without_token() {
        let validator = SupervisorValidator::new(DEFAULT_CHECK_URL, None, Duration::from_secs(1)).unwrap();
        assert!(matches!(validator.validate().await, Ok(Validation::Skipped(_))));

        let validator =
            SupervisorValidator::new(DEFAULT_CHECK_URL, Some(String::new()), Duration::from_secs(1)).unwrap();
        assert!(matches!(validator.validate().await, Ok(Validation::Skipped(_))));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let validator = SupervisorValidator::new(
            format!("http://{}/core/api/config/core/check_config", addr),
            Some("supervisor-token".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            validator.validate().await,
            Err(ConfigError::ValidatorUnreachable(_))
        ));
    }
}
