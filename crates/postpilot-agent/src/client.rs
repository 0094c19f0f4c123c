//! Client for the local MCP browser-automation service.
//!
//! One client per task account. The service owns the browser session and the
//! shared cookie file; this side only issues the run/login calls and relays
//! payloads. Run calls carry no client-side timeout — a round can take
//! minutes and the service enforces its own budget.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{AgentError, LoginHandshake, LoginProbe, OperatorAgent, RunContext};

/// Operator agent backed by the MCP automation service.
pub struct McpOperatorAgent {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    probe_timeout: Duration,
}

#[derive(Deserialize)]
struct RunResponse {
    should_continue: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct LoginStatusResponse {
    /// None when the service could not determine the state.
    logged_in: Option<bool>,
}

#[derive(Deserialize)]
struct ConfirmResponse {
    logged_in: bool,
}

impl McpOperatorAgent {
    pub fn new(base_url: &str, account_id: &str, probe_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            probe_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/operator/{}", self.base_url, path)
    }
}

#[async_trait]
impl OperatorAgent for McpOperatorAgent {
    async fn run_once(&self, ctx: RunContext) -> Result<bool, AgentError> {
        tracing::debug!(
            "🤖 round {} for account '{}' (mode {})",
            ctx.round,
            ctx.account_id,
            ctx.mode
        );
        let resp = self
            .http
            .post(self.url("run"))
            .json(&ctx)
            .send()
            .await?
            .error_for_status()?;

        let body: RunResponse = resp.json().await?;
        if let Some(err) = body.error {
            return Err(AgentError::Service(err));
        }
        Ok(body.should_continue)
    }

    async fn login_status(&self) -> Result<LoginProbe, AgentError> {
        let resp = self
            .http
            .get(self.url("login/status"))
            .query(&[("account_id", self.account_id.as_str())])
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;

        let body: LoginStatusResponse = resp.json().await?;
        Ok(match body.logged_in {
            Some(true) => LoginProbe::LoggedIn,
            Some(false) => LoginProbe::NotLoggedIn,
            None => LoginProbe::Unknown,
        })
    }

    async fn begin_login(&self) -> Result<LoginHandshake, AgentError> {
        let resp = self
            .http
            .post(self.url("login/qrcode"))
            .query(&[("account_id", self.account_id.as_str())])
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;

        // The service answers 204 when the stored cookies are still valid,
        // otherwise a PNG body with the QR code to scan.
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(LoginHandshake::AlreadyLoggedIn);
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(AgentError::Service("empty QR code payload".into()));
        }
        Ok(LoginHandshake::QrCode(bytes.to_vec()))
    }

    async fn confirm_login(&self) -> Result<bool, AgentError> {
        let resp = self
            .http
            .post(self.url("login/confirm"))
            .query(&[("account_id", self.account_id.as_str())])
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;

        let body: ConfirmResponse = resp.json().await?;
        Ok(body.logged_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_building_strips_trailing_slash() {
        let agent =
            McpOperatorAgent::new("http://localhost:18060/", "acc-1", Duration::from_secs(5));
        assert_eq!(agent.url("run"), "http://localhost:18060/operator/run");
        assert_eq!(
            agent.url("login/status"),
            "http://localhost:18060/operator/login/status"
        );
    }
}
