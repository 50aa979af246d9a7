//! REST client for the edge control plane.

use anyhow::{anyhow, Context};
use serde_json::Value;

use crate::config::Auth;
use crate::error::{CliError, CliResult};

pub struct ApiClient {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(auth: &Auth) -> CliResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            base: auth.server.trim_end_matches('/').to_string(),
            token: auth.token.clone(),
            http,
        })
    }

    pub async fn list_tunnels(&self) -> CliResult<Value> {
        self.request(reqwest::Method::GET, "/api/tunnels", None).await
    }

    pub async fn close_tunnel(&self, tunnel_id: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/api/tunnels/{tunnel_id}"),
            None,
        )
        .await
    }

    pub async fn add_domain(&self, hostname: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::POST,
            "/api/domains",
            Some(serde_json::json!({ "hostname": hostname })),
        )
        .await
    }

    pub async fn list_domains(&self) -> CliResult<Value> {
        self.request(reqwest::Method::GET, "/api/domains", None).await
    }

    pub async fn get_domain(&self, domain_id: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/api/domains/{domain_id}"),
            None,
        )
        .await
    }

    pub async fn verify_domain(&self, domain_id: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/domains/{domain_id}/verify"),
            None,
        )
        .await
    }

    pub async fn remove_domain(&self, domain_id: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/api/domains/{domain_id}"),
            None,
        )
        .await
    }

    pub async fn assign_domain(&self, domain_id: &str, tunnel_id: &str) -> CliResult<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/domains/{domain_id}/assign"),
            Some(serde_json::json!({ "tunnel_id": tunnel_id })),
        )
        .await
    }

    pub async fn health(&self) -> CliResult<Value> {
        self.request(reqwest::Method::GET, "/healthz", None).await
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> CliResult<Value> {
        let url = format!("{}{}", self.base, path);
        let mut builder = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let payload: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::Null);

        if status.is_success() {
            return Ok(payload);
        }
        let message = payload
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "request failed".to_string());
        match status.as_u16() {
            404 => Err(CliError::Other(anyhow!("not found: {message}"))),
            code => Err(CliError::from_status(code, &message)),
        }
    }
}
