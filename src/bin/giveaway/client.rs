//! Giveaway server API client

use anyhow::{anyhow, Result};
use invite_giveaways::models::{Giveaway, GiveawayStats, NewGiveaway};
use invite_giveaways::{Settings, SettingsPatch};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Leaderboard row as served by `/giveaways/:id/leaderboard`
#[derive(Debug, Deserialize)]
pub struct StandingRow {
    pub user_id: String,
    pub username: Option<String>,
    pub count: u32,
    pub invitees: usize,
}

#[derive(Debug, Deserialize)]
pub struct Standings {
    pub giveaway: Giveaway,
    pub entries: Vec<StandingRow>,
    pub active_codes: usize,
    pub total_invitees: usize,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
    pub active_giveaways: usize,
}

pub struct GiveawayClient {
    client: Client,
    base_url: String,
}

impl GiveawayClient {
    pub fn new(server_url: &str) -> Self {
        // Build HTTP client with timeout, falling back to default client if builder fails
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(&self, what: &str, request: RequestBuilder) -> Result<T> {
        let resp = request.send().await?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = body["error"].as_str().unwrap_or("Unknown error");
            Err(anyhow!("Failed to {} ({}): {}", what, status, message))
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.send("check health", self.client.get(self.url("health")))
            .await
    }

    pub async fn stats(&self) -> Result<GiveawayStats> {
        self.send("fetch stats", self.client.get(self.url("stats")))
            .await
    }

    pub async fn list(&self) -> Result<Vec<Giveaway>> {
        self.send("list giveaways", self.client.get(self.url("giveaways")))
            .await
    }

    pub async fn leaderboard(&self, giveaway_id: &str) -> Result<Standings> {
        let url = self.url(&format!("giveaways/{}/leaderboard", giveaway_id));
        self.send("fetch leaderboard", self.client.get(url)).await
    }

    pub async fn create(&self, request: &NewGiveaway) -> Result<Giveaway> {
        let request = self.client.post(self.url("giveaways")).json(request);
        self.send("create giveaway", request).await
    }

    pub async fn end(&self, giveaway_id: &str) -> Result<Giveaway> {
        let url = self.url(&format!("giveaways/{}/end", giveaway_id));
        self.send("end giveaway", self.client.post(url)).await
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.send("fetch settings", self.client.get(self.url("settings")))
            .await
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings> {
        let request = self.client.patch(self.url("settings")).json(patch);
        self.send("update settings", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_strips_trailing_slash() {
        let client = GiveawayClient::new("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_url() {
        let client = GiveawayClient::new("http://localhost:8080");
        assert_eq!(
            client.url("/giveaways/g1/end"),
            "http://localhost:8080/giveaways/g1/end"
        );
    }
}
