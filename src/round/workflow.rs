//! Drawer-side round duties: periodic prediction checkpoints and the
//! end-of-round sequence. Only the drawer's client runs these; everyone
//! else stays passive until the review broadcast arrives.

use std::sync::Arc;

use tracing::warn;

use crate::domain::{Guess, RoundId, MODEL_PROFILE_ID};
use crate::events::RoomEvent;
use crate::predict::{PredictError, PredictionClient};
use crate::round::scoring::model_takes_round;
use crate::stores::{snapshot_key, Backend};

const LOG_TARGET: &str = "round::workflow";

/// The external drawing surface. Rendering and stroke capture are not this
/// crate's concern; the embedder hands in something that can export the
/// current drawing as PNG bytes.
pub trait SketchSurface: Send + Sync {
    fn export_png(&self) -> anyhow::Result<Vec<u8>>;
}

/// Result of the drawer's end-of-round sequence. Every step is best-effort;
/// the round ends regardless of which parts succeeded.
#[derive(Debug)]
pub struct RoundFinish {
    pub snapshot_url: Option<String>,
    /// Prediction update to fan out, when the final prediction succeeded.
    pub prediction: Option<RoomEvent>,
    /// Whether the final prediction satisfies the model-wins rule.
    pub model_decides: bool,
}

pub struct DrawerWorkflow {
    backend: Backend,
    prediction: Arc<dyn PredictionClient>,
    surface: Arc<dyn SketchSurface>,
}

impl DrawerWorkflow {
    pub fn new(
        backend: Backend,
        prediction: Arc<dyn PredictionClient>,
        surface: Arc<dyn SketchSurface>,
    ) -> Self {
        Self {
            backend,
            prediction,
            surface,
        }
    }

    /// One mid-round checkpoint: export, predict, score, record the model's
    /// guess. Returns the prediction update to broadcast.
    pub async fn checkpoint(
        &self,
        round: RoundId,
        topic_text: &str,
    ) -> Result<RoomEvent, PredictError> {
        let image = self
            .surface
            .export_png()
            .map_err(|err| PredictError::Unavailable(err.to_string()))?;
        let prediction = self.prediction.predict(&image).await?;
        let similarity = self
            .prediction
            .similarity(&prediction.label, topic_text)
            .await?;

        self.record_model_guess(round, &prediction.label, prediction.confidence)
            .await;

        Ok(RoomEvent::PredictionUpdate {
            label: prediction.label,
            confidence: prediction.confidence,
            similarity,
        })
    }

    /// End-of-round sequence: final snapshot upload keyed by round id, one
    /// last prediction + similarity, model guess record. Failures are
    /// swallowed; the round must end either way.
    pub async fn finish(&self, round: RoundId, topic_text: &str) -> RoundFinish {
        let image = match self.surface.export_png() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(target = LOG_TARGET, round, error = %err, "final snapshot export failed");
                None
            }
        };

        let mut snapshot_url = None;
        if let Some(bytes) = &image {
            let key = snapshot_key(round);
            match self.backend.snapshots.upload(&key, bytes.clone()).await {
                Ok(()) => snapshot_url = Some(self.backend.snapshots.public_url(&key)),
                Err(err) => {
                    warn!(target = LOG_TARGET, round, error = %err, "snapshot upload failed");
                }
            }
        }

        let mut prediction_event = None;
        let mut model_decides = false;
        if let Some(bytes) = image {
            match self.final_prediction(round, topic_text, &bytes).await {
                Ok((event, decides)) => {
                    prediction_event = Some(event);
                    model_decides = decides;
                }
                Err(err) => {
                    warn!(target = LOG_TARGET, round, error = %err, "final prediction failed");
                }
            }
        }

        RoundFinish {
            snapshot_url,
            prediction: prediction_event,
            model_decides,
        }
    }

    async fn final_prediction(
        &self,
        round: RoundId,
        topic_text: &str,
        image: &[u8],
    ) -> Result<(RoomEvent, bool), PredictError> {
        let prediction = self.prediction.predict(image).await?;
        let similarity = self
            .prediction
            .similarity(&prediction.label, topic_text)
            .await?;
        self.record_model_guess(round, &prediction.label, prediction.confidence)
            .await;
        let decides = model_takes_round(&prediction.label, similarity, topic_text);
        Ok((
            RoomEvent::PredictionUpdate {
                label: prediction.label,
                confidence: prediction.confidence,
                similarity,
            },
            decides,
        ))
    }

    async fn record_model_guess(&self, round: RoundId, label: &str, confidence: f64) {
        let guess = Guess {
            round,
            profile: MODEL_PROFILE_ID,
            text: label.to_string(),
            confidence: Some(confidence),
        };
        if let Err(err) = self.backend.guesses.upsert(&guess).await {
            warn!(target = LOG_TARGET, round, error = %err, "failed to record model guess");
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::domain::{Prediction, RoomCode};
    use crate::predict::ScriptedPredictionClient;
    use crate::stores::memory::InMemoryBackend;

    use super::*;

    struct StubSurface;

    impl SketchSurface for StubSurface {
        fn export_png(&self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }

    fn workflow(script: Vec<Prediction>) -> (DrawerWorkflow, Backend) {
        let backend = InMemoryBackend::new().backend();
        let prediction = Arc::new(ScriptedPredictionClient::new(script, 0.3));
        let workflow = DrawerWorkflow::new(backend.clone(), prediction, Arc::new(StubSurface));
        (workflow, backend)
    }

    #[tokio::test]
    async fn checkpoint_records_model_guess_and_reports_similarity() {
        let (workflow, backend) = workflow(vec![Prediction {
            label: "fruit".into(),
            confidence: 0.7,
        }]);
        let round = backend
            .rounds
            .create(&RoomCode::parse("ABCD").unwrap(), 1, Uuid::new_v4())
            .await
            .unwrap();

        let event = workflow.checkpoint(round.id, "banana").await.unwrap();
        match event {
            RoomEvent::PredictionUpdate {
                label,
                confidence,
                similarity,
            } => {
                assert_eq!(label, "fruit");
                assert_eq!(confidence, 0.7);
                assert_eq!(similarity, 0.3);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let guesses = backend.guesses.list_by_round(round.id).await.unwrap();
        assert_eq!(guesses.len(), 1);
        assert_eq!(guesses[0].profile, MODEL_PROFILE_ID);
        assert_eq!(guesses[0].text, "fruit");
    }

    #[tokio::test]
    async fn finish_uploads_snapshot_and_flags_model_win() {
        let (workflow, backend) = workflow(vec![Prediction {
            label: "banana".into(),
            confidence: 0.95,
        }]);
        let round = backend
            .rounds
            .create(&RoomCode::parse("ABCD").unwrap(), 1, Uuid::new_v4())
            .await
            .unwrap();

        let finish = workflow.finish(round.id, "banana").await;
        assert!(finish.model_decides);
        assert!(finish.prediction.is_some());
        let url = finish.snapshot_url.unwrap();
        assert!(url.ends_with(&snapshot_key(round.id)));
    }

    #[tokio::test]
    async fn finish_survives_prediction_outage() {
        let (workflow, backend) = workflow(Vec::new());
        let round = backend
            .rounds
            .create(&RoomCode::parse("ABCD").unwrap(), 1, Uuid::new_v4())
            .await
            .unwrap();

        let finish = workflow.finish(round.id, "banana").await;
        assert!(!finish.model_decides);
        assert!(finish.prediction.is_none());
        assert!(finish.snapshot_url.is_some());
    }
}
