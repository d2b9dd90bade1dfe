//! AI prediction collaborator: label a drawing, score word similarity.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::Prediction;

pub mod http;

pub use http::{HttpPredictionClient, PredictionEndpointConfig};

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("prediction endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("malformed prediction response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PredictionClient: Send + Sync {
    /// Labels a PNG-encoded drawing.
    async fn predict(&self, image_png: &[u8]) -> Result<Prediction, PredictError>;

    /// Semantic similarity between two words, clamped to [0, 1].
    async fn similarity(&self, word_a: &str, word_b: &str) -> Result<f64, PredictError>;
}

/// Scripted client for tests and the demo: pops predictions from a queue
/// and scores similarity as 1.0 on a case-insensitive match, otherwise a
/// fixed fallback.
pub struct ScriptedPredictionClient {
    queue: Mutex<VecDeque<Prediction>>,
    fallback_similarity: f64,
}

impl ScriptedPredictionClient {
    pub fn new(script: Vec<Prediction>, fallback_similarity: f64) -> Self {
        Self {
            queue: Mutex::new(script.into()),
            fallback_similarity,
        }
    }
}

#[async_trait]
impl PredictionClient for ScriptedPredictionClient {
    async fn predict(&self, _image_png: &[u8]) -> Result<Prediction, PredictError> {
        self.queue
            .lock()
            .pop_front()
            .ok_or_else(|| PredictError::Unavailable("prediction script exhausted".into()))
    }

    async fn similarity(&self, word_a: &str, word_b: &str) -> Result<f64, PredictError> {
        if word_a.eq_ignore_ascii_case(word_b) {
            Ok(1.0)
        } else {
            Ok(self.fallback_similarity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_pops_in_order_then_fails() {
        let client = ScriptedPredictionClient::new(
            vec![
                Prediction {
                    label: "fruit".into(),
                    confidence: 0.5,
                },
                Prediction {
                    label: "banana".into(),
                    confidence: 0.9,
                },
            ],
            0.3,
        );
        assert_eq!(client.predict(&[]).await.unwrap().label, "fruit");
        assert_eq!(client.predict(&[]).await.unwrap().label, "banana");
        assert!(matches!(
            client.predict(&[]).await,
            Err(PredictError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn scripted_similarity_peaks_on_match() {
        let client = ScriptedPredictionClient::new(Vec::new(), 0.25);
        assert_eq!(client.similarity("Banana", "banana").await.unwrap(), 1.0);
        assert_eq!(client.similarity("pear", "banana").await.unwrap(), 0.25);
    }
}
