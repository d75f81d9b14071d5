use std::time::Duration;

use labstage_core::{ExtractionQuery, RawAnswer, StorageLocation};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::service::{ExtractionService, ServiceError};

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    region: &'a str,
    document: &'a StorageLocation,
    queries: Vec<QueryPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct QueryPayload<'a> {
    alias: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    answers: Vec<AnswerPayload>,
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    alias: String,
    text: String,
    confidence: f32,
}

/// JSON-over-HTTP client for the extraction service.
///
/// `POST {endpoint}/v1/analyze` with the document location and the ordered
/// queries; the reply lists answers for matched queries only.
#[derive(Debug, Clone)]
pub struct HttpExtractionService {
    client: Client,
    endpoint: String,
    region: String,
}

impl HttpExtractionService {
    pub fn new(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            region: region.into(),
        })
    }

    fn analyze_url(&self) -> String {
        format!("{}/v1/analyze", self.endpoint)
    }
}

impl ExtractionService for HttpExtractionService {
    async fn analyze(
        &self,
        location: &StorageLocation,
        queries: &[ExtractionQuery],
    ) -> Result<Vec<RawAnswer>, ServiceError> {
        let request = AnalyzeRequest {
            region: &self.region,
            document: location,
            queries: queries
                .iter()
                .map(|q| QueryPayload { alias: &q.metric, text: &q.question })
                .collect(),
        };

        let response = self
            .client
            .post(self.analyze_url())
            .json(&request)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(map_status(status, &body));
        }

        let parsed: AnalyzeResponse =
            serde_json::from_str(&body).map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        Ok(parsed
            .answers
            .into_iter()
            .map(|a| RawAnswer::new(a.alias, a.text, a.confidence))
            .collect())
    }
}

fn map_transport(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout
    } else {
        ServiceError::Unavailable(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> ServiceError {
    match status.as_u16() {
        429 => ServiceError::Throttled,
        408 | 504 => ServiceError::Timeout,
        s if s >= 500 => ServiceError::Unavailable(format!("HTTP {status}")),
        _ => {
            let detail: String = body.chars().take(200).collect();
            ServiceError::Rejected(format!("HTTP {status}: {detail}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labstage_core::ValueKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn queries() -> Vec<ExtractionQuery> {
        vec![
            ExtractionQuery::new("potassium", "What is the Potassium?", ValueKind::Numeric),
            ExtractionQuery::new("lab_date", "What is the lab collection date?", ValueKind::Date),
        ]
    }

    fn location() -> StorageLocation {
        StorageLocation::new("patient-uploads", "p1/labs.pdf")
    }

    async fn service_for(server: &MockServer) -> HttpExtractionService {
        HttpExtractionService::new(format!("{}/", server.uri()), "us-east-1", Duration::from_secs(2))
            .expect("client")
    }

    #[tokio::test]
    async fn sends_queries_and_parses_answers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/analyze"))
            .and(body_partial_json(serde_json::json!({
                "region": "us-east-1",
                "document": { "bucket": "patient-uploads", "key": "p1/labs.pdf" },
                "queries": [
                    { "alias": "potassium", "text": "What is the Potassium?" },
                    { "alias": "lab_date", "text": "What is the lab collection date?" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "answers": [{ "alias": "potassium", "text": "4.5 mEq/L", "confidence": 92.5 }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answers = service_for(&server).await.analyze(&location(), &queries()).await.unwrap();
        assert_eq!(answers, vec![RawAnswer::new("potassium", "4.5 mEq/L", 92.5)]);
        server.verify().await;
    }

    #[tokio::test]
    async fn empty_reply_means_nothing_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        let answers = service_for(&server).await.analyze(&location(), &queries()).await.unwrap();
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn throttling_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let err = service_for(&server).await.analyze(&location(), &queries()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Throttled));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = service_for(&server).await.analyze(&location(), &queries()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unsupported_document_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("UnsupportedDocumentException"))
            .mount(&server)
            .await;
        let err = service_for(&server).await.analyze(&location(), &queries()).await.unwrap_err();
        match err {
            ServiceError::Rejected(detail) => assert!(detail.contains("UnsupportedDocument")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        let err = service_for(&server).await.analyze(&location(), &queries()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let svc = HttpExtractionService::new(server.uri(), "us-east-1", Duration::from_millis(50)).unwrap();
        let err = svc.analyze(&location(), &queries()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout));
    }
}
