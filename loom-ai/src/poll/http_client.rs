//! `JobStatusSource` over the service's HTTP API

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{JobStatusSource, PollError};
use crate::governance::USER_ID_HEADER;
use crate::jobs::{JobStatusView, SubmitOutcome};

const USER_AGENT: &str = concat!("storyloom-client/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct SubmitBody<'a> {
    node_id: Uuid,
    timeline_id: Uuid,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct NodeImageBody {
    #[serde(default)]
    image_url: Option<String>,
}

pub struct HttpJobClient {
    http_client: reqwest::Client,
    base_url: String,
    user_id: String,
}

impl HttpJobClient {
    pub fn new(base_url: &str, user_id: &str) -> Result<Self, PollError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PollError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
        })
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PollError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PollError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response.json::<T>().await.map_err(|e| PollError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobStatusSource for HttpJobClient {
    async fn submit(&self, node_id: Uuid, timeline_id: Uuid, prompt: &str) -> Result<SubmitOutcome, PollError> {
        let response = self
            .http_client
            .post(format!("{}/api/images/generate", self.base_url))
            .header(USER_ID_HEADER, &self.user_id)
            .json(&SubmitBody {
                node_id,
                timeline_id,
                prompt,
            })
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;
        Self::read(response).await
    }

    async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, PollError> {
        let response = self
            .http_client
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;
        Self::read(response).await
    }

    async fn fetch_node_image(&self, timeline_id: Uuid, node_id: Uuid) -> Result<Option<String>, PollError> {
        let response = self
            .http_client
            .get(format!(
                "{}/api/timelines/{}/nodes/{}/image",
                self.base_url, timeline_id, node_id
            ))
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;
        let body: NodeImageBody = Self::read(response).await?;
        Ok(body.image_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HttpJobClient::new("http://localhost:5790/", "u1").unwrap();
        assert_eq!(client.base_url, "http://localhost:5790");
    }
}
