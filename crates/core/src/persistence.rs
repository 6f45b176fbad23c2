//! Client for the session persistence API.
//!
//! Every call is best-effort. The engine runs them off its own task and only
//! logs failures; a broken persistence API never blocks the conversation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::Speaker;
use crate::assessment::AssessmentRecord;
use crate::error::{VoiceError, VoiceResult};
use crate::transcript::UtteranceMetrics;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    pub speaker: Speaker,
    pub message: String,
    pub metrics: Option<UtteranceMetrics>,
    pub spoken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentAnswerPayload {
    pub assessment_id: String,
    pub option_id: String,
    pub is_correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// One completed turn of recent conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub speaker: Speaker,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateAssessmentRequest {
    pub context: Vec<ContextTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    async fn save_turn(&self, session_id: &str, turn: &TurnPayload) -> VoiceResult<()>;

    /// Returns a prepared assessment for the session, if there is one.
    async fn fetch_assessment(&self, session_id: &str) -> VoiceResult<Option<AssessmentRecord>>;

    async fn generate_assessment(
        &self,
        session_id: &str,
        request: &GenerateAssessmentRequest,
    ) -> VoiceResult<AssessmentRecord>;

    async fn save_assessment_answer(
        &self,
        session_id: &str,
        answer: &AssessmentAnswerPayload,
    ) -> VoiceResult<()>;
}

/// `PersistenceApi` over JSON HTTP.
pub struct HttpPersistence {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(failure)?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, session_id: &str, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, session_id, path)
    }
}

fn failure(e: impl std::fmt::Display) -> VoiceError {
    VoiceError::PersistenceFailure(e.to_string())
}

#[async_trait]
impl PersistenceApi for HttpPersistence {
    async fn save_turn(&self, session_id: &str, turn: &TurnPayload) -> VoiceResult<()> {
        self.client
            .post(self.url(session_id, "turns"))
            .json(turn)
            .send()
            .await
            .map_err(failure)?
            .error_for_status()
            .map_err(failure)?;
        debug!(session_id, speaker = %turn.speaker, "turn saved");
        Ok(())
    }

    async fn fetch_assessment(&self, session_id: &str) -> VoiceResult<Option<AssessmentRecord>> {
        let response = self
            .client
            .get(self.url(session_id, "assessment"))
            .send()
            .await
            .map_err(failure)?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::NO_CONTENT) {
            return Ok(None);
        }
        let record = response
            .error_for_status()
            .map_err(failure)?
            .json::<AssessmentRecord>()
            .await
            .map_err(failure)?;
        Ok(Some(record))
    }

    async fn generate_assessment(
        &self,
        session_id: &str,
        request: &GenerateAssessmentRequest,
    ) -> VoiceResult<AssessmentRecord> {
        self.client
            .post(self.url(session_id, "assessment"))
            .json(request)
            .send()
            .await
            .map_err(failure)?
            .error_for_status()
            .map_err(failure)?
            .json::<AssessmentRecord>()
            .await
            .map_err(failure)
    }

    async fn save_assessment_answer(
        &self,
        session_id: &str,
        answer: &AssessmentAnswerPayload,
    ) -> VoiceResult<()> {
        self.client
            .post(self.url(session_id, "assessment/answers"))
            .json(answer)
            .send()
            .await
            .map_err(failure)?
            .error_for_status()
            .map_err(failure)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::sample_record;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn turn() -> TurnPayload {
        TurnPayload {
            speaker: Speaker::User,
            message: "I hear you".to_string(),
            metrics: Some(UtteranceMetrics::compute("I hear you", Duration::from_secs(1), false)),
            spoken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_turn_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/turns"))
            .and(body_partial_json(serde_json::json!({
                "speaker": "user",
                "message": "I hear you",
                "metrics": { "word_count": 3 }
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpPersistence::new(format!("{}/", server.uri())).unwrap();
        api.save_turn("s1", &turn()).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_persistence_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/turns"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = HttpPersistence::new(server.uri()).unwrap();
        let err = api.save_turn("s1", &turn()).await.unwrap_err();
        assert!(matches!(err, VoiceError::PersistenceFailure(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_fetch_assessment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/s1/assessment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_record()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sessions/s2/assessment"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = HttpPersistence::new(server.uri()).unwrap();
        assert_eq!(api.fetch_assessment("s1").await.unwrap(), Some(sample_record()));
        assert_eq!(api.fetch_assessment("s2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generate_assessment_sends_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/assessment"))
            .and(body_partial_json(serde_json::json!({
                "context": [{ "speaker": "ai", "message": "Tell me what happened." }],
                "topic": "empathy"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_record()))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpPersistence::new(server.uri()).unwrap();
        let request = GenerateAssessmentRequest {
            context: vec![ContextTurn {
                speaker: Speaker::Ai,
                message: "Tell me what happened.".to_string(),
            }],
            topic: Some("empathy".to_string()),
        };
        let record = api.generate_assessment("s1", &request).await.unwrap();
        assert_eq!(record.id, "a-1");
    }

    #[tokio::test]
    async fn test_save_assessment_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s1/assessment/answers"))
            .and(body_partial_json(serde_json::json!({
                "assessment_id": "a-1",
                "option_id": "b",
                "is_correct": false
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpPersistence::new(server.uri()).unwrap();
        let answer = AssessmentAnswerPayload {
            assessment_id: "a-1".to_string(),
            option_id: "b".to_string(),
            is_correct: false,
            answered_at: Utc::now(),
        };
        api.save_assessment_answer("s1", &answer).await.unwrap();
    }
}
