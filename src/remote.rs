//! Collaborator endpoints consulted while a call is connecting: one issues a
//! short-lived agent credential, the other turns the candidate profile into
//! the interviewer's system prompt.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{InterviewProfile, VoiceConfig};
use crate::error::{Result, VoiceError};

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_credential(&self) -> Result<String>;

    async fn fetch_instructions(&self, profile: &InterviewProfile) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    key: String,
}

#[derive(Debug, Deserialize)]
struct InstructionsResponse {
    instructions: String,
}

/// reqwest-backed [`ConfigSource`].
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: reqwest::Client,
    token_url: String,
    instructions_url: String,
}

impl HttpConfigSource {
    pub fn new(token_url: impl Into<String>, instructions_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            instructions_url: instructions_url.into(),
        }
    }

    pub fn from_config(config: &VoiceConfig) -> Self {
        Self::new(config.token_url.clone(), config.instructions_url.clone())
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch_credential(&self) -> Result<String> {
        debug!("Requesting agent credential from {}", self.token_url);
        let body: CredentialResponse = self
            .client
            .get(&self.token_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.key.is_empty() {
            return Err(VoiceError::MissingConfig("credential endpoint returned an empty key".to_string()));
        }
        info!("Received agent credential");
        Ok(body.key)
    }

    async fn fetch_instructions(&self, profile: &InterviewProfile) -> Result<String> {
        debug!("Requesting interviewer prompt from {}", self.instructions_url);
        let body: InstructionsResponse = self
            .client
            .post(&self.instructions_url)
            .json(profile)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(chars = body.instructions.len(), "Received interviewer prompt");
        Ok(body.instructions)
    }
}
