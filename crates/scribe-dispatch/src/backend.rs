//! REST submission of job records to the backend API.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::auth::{AuthError, AuthTokenCache};
use crate::index::JobRecord;
use scribe_core::config::ApiConfig;

/// Metadata keys consumed by the dispatcher itself; everything else passes
/// through to the backend.
const CONSUMED_KEYS: [&str; 6] = [
    "uri",
    "filename",
    "download_path",
    "rec_time",
    "output",
    "silence",
];

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend rejected the record ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Assemble the JSON body POSTed per record.
pub fn build_job_body(record: &JobRecord, output: Option<&str>, spk: bool) -> Value {
    let mut body = Map::new();
    body.insert("uri".into(), Value::from(record.uri.clone()));

    let metadata: &BTreeMap<String, String> = &record.metadata;
    for (key, value) in metadata {
        if CONSUMED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "rec_date" {
            // The backend expects one combined timestamp field.
            let mut stamp = value.clone();
            if let Some(time) = metadata.get("rec_time") {
                stamp.push_str(time);
            }
            body.insert(key.clone(), Value::from(stamp));
        } else {
            body.insert(key.clone(), Value::from(value.clone()));
        }
    }

    if let Some(output) = output {
        body.insert("output".into(), Value::from(output));
    }
    if spk {
        body.insert("spk".into(), Value::from("true"));
    }
    body.insert("silence".into(), Value::from("yes"));
    Value::Object(body)
}

pub struct Backend {
    http: reqwest::Client,
    jobs_url: String,
    auth: Arc<AuthTokenCache>,
}

impl Backend {
    pub fn new(http: reqwest::Client, api: &ApiConfig, auth: Arc<AuthTokenCache>) -> Self {
        Backend {
            http,
            jobs_url: api.jobs_url(),
            auth,
        }
    }

    pub fn auth(&self) -> &Arc<AuthTokenCache> {
        &self.auth
    }

    /// POST one record. A 401 invalidates the cached token and the request
    /// is retried exactly once with fresh credentials.
    pub async fn submit(&self, body: &Value) -> Result<(), SubmitError> {
        match self.submit_once(body).await {
            Err(SubmitError::Rejected { status, .. })
                if status == reqwest::StatusCode::UNAUTHORIZED =>
            {
                tracing::info!("retry job after re-authentication");
                self.submit_once(body).await
            }
            other => other,
        }
    }

    async fn submit_once(&self, body: &Value) -> Result<(), SubmitError> {
        let header = self.auth.header().await?;
        tracing::debug!(url = %self.jobs_url, body = %body, "POST job");

        let res = self
            .http
            .post(&self.jobs_url)
            .header("Accept", "application/json")
            .header(header.name, &header.value)
            .json(body)
            .send()
            .await?;

        let status = res.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED {
            return Ok(());
        }

        let text = res.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.auth.invalidate(&header.value).await;
        }
        Err(SubmitError::Rejected { status, body: text })
    }
}
