//! Client for the remote plant classifier.
//!
//! One multipart `POST` per image; the JSON answer is decoded into a ranked,
//! non-empty list of candidates whose order is owned by the classifier.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::error::WorkflowError;
use crate::image_source::Image;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantInfo {
    pub description: String,
    #[serde(default)]
    pub uses: Vec<String>,
}

/// One ranked classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCandidate {
    #[serde(rename = "class_name")]
    pub label: String,
    pub confidence: f64,
    pub class_index: i64,
    #[serde(rename = "ayurvedic_info")]
    pub info: PlantInfo,
}

impl PredictionCandidate {
    /// Confidence as shown to the user, e.g. `92.0%`.
    pub fn confidence_percent(&self) -> String {
        format!("{:.1}%", self.confidence * 100.0)
    }
}

/// Non-empty ranked candidates; index 0 is the primary result.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions(Vec<PredictionCandidate>);

impl Predictions {
    pub fn new(candidates: Vec<PredictionCandidate>) -> Option<Self> {
        if candidates.is_empty() {
            None
        } else {
            Some(Self(candidates))
        }
    }

    /// Highest-ranked candidate.
    pub fn primary(&self) -> &PredictionCandidate {
        &self.0[0]
    }

    pub fn alternatives(&self) -> &[PredictionCandidate] {
        &self.0[1..]
    }

    pub fn all(&self) -> &[PredictionCandidate] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub type PredictionOutcome = Result<Predictions, WorkflowError>;

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn predict(&self, image: &Image) -> PredictionOutcome;
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    prediction: Option<PredictionCandidate>,
    #[serde(default)]
    top_predictions: Option<Vec<PredictionCandidate>>,
}

/// Decode a successful classifier body into ranked candidates.
pub fn decode_prediction_body(body: &[u8]) -> PredictionOutcome {
    let response: PredictionResponse = serde_json::from_slice(body)
        .map_err(|e| WorkflowError::InvalidResponse(format!("malformed JSON body: {}", e)))?;

    let prediction = response
        .prediction
        .ok_or_else(|| WorkflowError::InvalidResponse("missing `prediction`".to_string()))?;

    let ranked = match response.top_predictions {
        Some(top) if !top.is_empty() => {
            if top[0] != prediction {
                log::warn!(
                    "Classifier `prediction` ({}) differs from first ranked candidate ({}), using ranked list",
                    prediction.label,
                    top[0].label
                );
            }
            top
        }
        _ => vec![prediction],
    };

    for candidate in &ranked {
        if !candidate.confidence.is_finite() || !(0.0..=1.0).contains(&candidate.confidence) {
            return Err(WorkflowError::InvalidResponse(format!(
                "confidence {} for {} is outside [0, 1]",
                candidate.confidence, candidate.label
            )));
        }
    }

    Predictions::new(ranked)
        .ok_or_else(|| WorkflowError::InvalidResponse("no candidates".to_string()))
}

/// Message to surface for a non-2xx answer.
pub fn error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(|m| m.as_str()) {
                if !message.trim().is_empty() {
                    return message.to_string();
                }
            }
        }
    }

    let text = body.trim();
    if text.is_empty() {
        format!("request failed with status {}", status)
    } else {
        text.to_string()
    }
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request to classifier timed out".to_string()
    } else if err.is_connect() {
        format!("could not connect to classifier: {}", err)
    } else {
        err.to_string()
    }
}

pub struct HttpPredictionClient {
    http: reqwest::Client,
    url: String,
    field_name: String,
    file_name: String,
}

impl HttpPredictionClient {
    /// Client for the configured endpoint with the configured timeout.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.server.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: config.prediction_url(),
            field_name: config.upload.field_name.clone(),
            file_name: config.upload.file_name.clone(),
        })
    }

    /// Endpoint the image is posted to.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn form_for(&self, image: &Image) -> Result<Form, WorkflowError> {
        let part = Part::bytes(image.bytes().to_vec())
            .file_name(self.file_name.clone())
            .mime_str(image.mime_type())
            .map_err(|e| WorkflowError::NetworkError(format!("invalid content type: {}", e)))?;
        Ok(Form::new().part(self.field_name.clone(), part))
    }
}

#[async_trait]
impl Classifier for HttpPredictionClient {
    async fn predict(&self, image: &Image) -> PredictionOutcome {
        let form = self.form_for(image)?;
        log::info!(
            "Uploading {} ({} bytes) to {}",
            image.mime_type(),
            image.len(),
            self.url
        );

        let response = self
            .http
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| WorkflowError::NetworkError(describe_transport_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status.as_u16(), &body);
            log::warn!("Classifier answered {}: {}", status, message);
            return Err(WorkflowError::NetworkError(message));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WorkflowError::NetworkError(describe_transport_error(&e)))?;
        let predictions = decode_prediction_body(&body)?;

        log::info!(
            "Classifier predicted {} ({}), {} candidate(s)",
            predictions.primary().label,
            predictions.primary().confidence_percent(),
            predictions.len()
        );
        Ok(predictions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::image_source::tests::jpeg_file;
    use crate::image_source::ImageSource;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    pub(crate) fn candidate(label: &str, confidence: f64, class_index: i64) -> Value {
        json!({
            "class_name": label,
            "confidence": confidence,
            "class_index": class_index,
            "ayurvedic_info": {
                "description": format!("{} is a medicinal plant.", label),
                "uses": ["Respiratory relief", "Reduces stress", "Helps with fever", "Anti-inflammatory"]
            }
        })
    }

    pub(crate) fn tulsi_response() -> Value {
        json!({
            "prediction": candidate("Tulsi", 0.92, 3),
            "top_predictions": [candidate("Tulsi", 0.92, 3), candidate("Neem", 0.05, 7)]
        })
    }

    pub(crate) fn predictions_from(value: Value) -> Predictions {
        decode_prediction_body(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_decode_uses_ranked_list() {
        let predictions = predictions_from(tulsi_response());
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions.primary().label, "Tulsi");
        assert_eq!(predictions.primary().class_index, 3);
        assert_eq!(predictions.alternatives()[0].label, "Neem");
        assert_eq!(predictions.primary().info.uses.len(), 4);
    }

    #[test]
    fn test_decode_keeps_classifier_order() {
        let body = json!({
            "prediction": candidate("Neem", 0.40, 7),
            "top_predictions": [candidate("Amla", 0.10, 1), candidate("Neem", 0.40, 7)]
        });
        let predictions = predictions_from(body);
        assert_eq!(predictions.primary().label, "Amla");
        assert_eq!(predictions.alternatives()[0].label, "Neem");
    }

    #[test]
    fn test_decode_without_ranked_list() {
        let predictions = predictions_from(json!({ "prediction": candidate("Aloe", 0.7, 0) }));
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions.primary().label, "Aloe");

        let empty = predictions_from(json!({
            "prediction": candidate("Aloe", 0.7, 0),
            "top_predictions": []
        }));
        assert_eq!(empty.all().len(), 1);
    }

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        let missing = json!({ "top_predictions": [candidate("Tulsi", 0.9, 3)] });
        assert!(matches!(
            decode_prediction_body(missing.to_string().as_bytes()),
            Err(WorkflowError::InvalidResponse(_))
        ));

        assert!(matches!(
            decode_prediction_body(b"<html>oops</html>"),
            Err(WorkflowError::InvalidResponse(_))
        ));

        let out_of_range = json!({ "prediction": candidate("Tulsi", 1.5, 3) });
        assert!(matches!(
            decode_prediction_body(out_of_range.to_string().as_bytes()),
            Err(WorkflowError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_confidence_percent() {
        let predictions = predictions_from(tulsi_response());
        assert_eq!(predictions.primary().confidence_percent(), "92.0%");
        assert_eq!(predictions.alternatives()[0].confidence_percent(), "5.0%");
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(400, r#"{"status":"error","message":"Invalid image"}"#),
            "Invalid image"
        );
        assert_eq!(error_message(500, r#"{"error":"boom"}"#), "boom");
        assert_eq!(error_message(502, "Bad Gateway"), "Bad Gateway");
        assert_eq!(error_message(503, "  "), "request failed with status 503");
    }

    async fn classify(mut multipart: Multipart) -> (StatusCode, Json<Value>) {
        while let Ok(Some(field)) = multipart.next_field().await {
            let name = field.name().map(str::to_string);
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.unwrap_or_default();

            if name.as_deref() == Some("file")
                && file_name.as_deref() == Some("plant-image.jpg")
                && content_type.as_deref() == Some("image/jpeg")
                && !bytes.is_empty()
            {
                return (StatusCode::OK, Json(tulsi_response()));
            }
        }
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "No file part" })),
        )
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: &str) -> HttpPredictionClient {
        let config = ConfigBuilder::new()
            .base_url(base_url)
            .timeout_seconds(1)
            .build()
            .unwrap();
        HttpPredictionClient::new(&config).unwrap()
    }

    fn sample_image() -> Image {
        ImageSource::new(1024 * 1024, 92)
            .from_file(&jpeg_file("tulsi.jpg"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_predict_sends_multipart_upload() {
        let app = Router::new().route("/medicinal-plant-prediction", post(classify));
        let client = client_for(&serve(app).await);

        let predictions = client.predict(&sample_image()).await.unwrap();
        assert_eq!(predictions.primary().label, "Tulsi");
        assert_eq!(predictions.len(), 2);
    }

    #[tokio::test]
    async fn test_predict_surfaces_server_message() {
        let app = Router::new().route(
            "/medicinal-plant-prediction",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "status": "error", "message": "Model not loaded" })),
                )
            }),
        );
        let client = client_for(&serve(app).await);

        let result = client.predict(&sample_image()).await;
        assert_eq!(
            result,
            Err(WorkflowError::NetworkError("Model not loaded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_predict_rejects_body_without_prediction() {
        let app = Router::new().route(
            "/medicinal-plant-prediction",
            post(|| async { Json(json!({ "status": "success" })) }),
        );
        let client = client_for(&serve(app).await);

        let result = client.predict(&sample_image()).await;
        assert!(matches!(result, Err(WorkflowError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_predict_times_out() {
        let app = Router::new().route(
            "/medicinal-plant-prediction",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(tulsi_response())
            }),
        );
        let client = client_for(&serve(app).await);

        let result = client.predict(&sample_image()).await;
        assert!(matches!(result, Err(WorkflowError::NetworkError(_))));
    }

    #[tokio::test]
    async fn test_predict_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(&format!("http://{}", addr));
        let result = client.predict(&sample_image()).await;
        assert!(matches!(result, Err(WorkflowError::NetworkError(_))));
    }
}
