use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use thiserror::Error;

use rollcall_core::RecognitionReply;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("recognition service returned status {0}")]
    Status(u16),
}

/// HTTP client for the external recognition service. The service is
/// treated as unreliable; every call carries a request timeout and a
/// failed call is discarded by the caller rather than retried here.
#[derive(Clone)]
pub struct RecognitionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RecognitionClient {
    pub fn new(endpoint: String, timeout_secs: u64) -> Result<Self, RecognizerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Submit one PNG frame for recognition.
    pub async fn recognize(
        &self,
        session_id: &str,
        captured_at: DateTime<Utc>,
        motion_strength: f32,
        png: Vec<u8>,
    ) -> Result<RecognitionReply, RecognizerError> {
        let form = Form::new()
            .text("session_id", session_id.to_string())
            .text("timestamp", captured_at.to_rfc3339())
            .text("motion_strength", motion_strength.to_string())
            .part(
                "image",
                Part::bytes(png)
                    .file_name("frame.png")
                    .mime_str("image/png")?,
            );

        let response = self.http.post(&self.endpoint).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RecognizerError::Status(status.as_u16()));
        }
        Ok(response.json::<RecognitionReply>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RecognitionClient {
        RecognitionClient::new(format!("{}/recognize", server.uri()), 5).unwrap()
    }

    #[tokio::test]
    async fn test_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "faces_detected": 2,
                "matches": [
                    {"student_id": "s1", "confidence": 0.91},
                    {"student_id": "s2", "confidence": 0.44}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let reply = client
            .recognize("sess-1", Utc::now(), 0.42, vec![0x89, 0x50, 0x4e, 0x47])
            .await
            .unwrap();

        assert_eq!(reply.faces_detected, 2);
        assert_eq!(reply.matches.len(), 2);
        assert_eq!(reply.matches[0].student_id, "s1");
    }

    #[tokio::test]
    async fn test_missing_matches_field_defaults_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"faces_detected": 0})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let reply = client
            .recognize("sess-1", Utc::now(), 0.0, vec![1, 2, 3])
            .await
            .unwrap();

        assert_eq!(reply.faces_detected, 0);
        assert!(reply.matches.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .recognize("sess-1", Utc::now(), 0.2, vec![1, 2, 3])
            .await
            .unwrap_err();

        assert!(matches!(err, RecognizerError::Status(500)));
    }
}
