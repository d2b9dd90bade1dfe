use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::Prediction;

use super::{PredictError, PredictionClient};

#[derive(Clone, Debug)]
pub struct PredictionEndpointConfig {
    /// Base URL of the prediction service, e.g. `http://localhost:8000/api`.
    pub base_url: Url,
    /// Model hint forwarded to the service.
    pub model: String,
}

pub struct HttpPredictionClient {
    cfg: PredictionEndpointConfig,
    http: reqwest::Client,
}

impl HttpPredictionClient {
    pub fn new(cfg: PredictionEndpointConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.cfg.base_url.as_str().trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct ImageInput {
    format: &'static str,
    base64_data: String,
}

#[derive(Serialize)]
struct PredictionRequest {
    images: Vec<ImageInput>,
    top_k: u32,
    model: String,
}

#[derive(Deserialize)]
struct PredictionDetail {
    label: String,
    confidence: f64,
}

#[derive(Deserialize)]
struct PredictionResponse {
    predictions: Vec<PredictionDetail>,
}

#[derive(Serialize)]
struct ComparisonRequest<'a> {
    word1: &'a str,
    word2: &'a str,
}

#[derive(Deserialize)]
struct ComparisonResponse {
    similarity: f64,
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict(&self, image_png: &[u8]) -> Result<Prediction, PredictError> {
        let request = PredictionRequest {
            images: vec![ImageInput {
                format: "image/png",
                base64_data: BASE64.encode(image_png),
            }],
            top_k: 1,
            model: self.cfg.model.clone(),
        };

        let response = self
            .http
            .post(self.endpoint("predict"))
            .json(&request)
            .send()
            .await
            .map_err(|err| PredictError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PredictError::Unavailable(format!(
                "predict returned status {}",
                response.status()
            )));
        }

        let decoded: PredictionResponse = response
            .json()
            .await
            .map_err(|err| PredictError::Malformed(err.to_string()))?;
        decoded
            .predictions
            .into_iter()
            .next()
            .map(|detail| Prediction {
                label: detail.label,
                confidence: detail.confidence.clamp(0.0, 1.0),
            })
            .ok_or_else(|| PredictError::Malformed("empty prediction list".into()))
    }

    async fn similarity(&self, word_a: &str, word_b: &str) -> Result<f64, PredictError> {
        let response = self
            .http
            .post(self.endpoint("compare"))
            .json(&ComparisonRequest {
                word1: word_a,
                word2: word_b,
            })
            .send()
            .await
            .map_err(|err| PredictError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PredictError::Unavailable(format!(
                "compare returned status {}",
                response.status()
            )));
        }

        let decoded: ComparisonResponse = response
            .json()
            .await
            .map_err(|err| PredictError::Malformed(err.to_string()))?;
        Ok(decoded.similarity.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = HttpPredictionClient::new(PredictionEndpointConfig {
            base_url: Url::parse("http://localhost:8000/api/").unwrap(),
            model: "openai".into(),
        });
        assert_eq!(client.endpoint("predict"), "http://localhost:8000/api/predict");
    }
}
