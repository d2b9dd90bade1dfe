//! Runs a complete round between two in-process clients over the local
//! channel hub: join, start, draw, guess, AI checkpoints, review.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sketchdash::channel::{ChannelFactory, LocalHub};
use sketchdash::domain::{topic_text, Prediction, Profile, RoomCode, RoundOutcome, StrokePath};
use sketchdash::predict::ScriptedPredictionClient;
use sketchdash::round::SketchSurface;
use sketchdash::session::{Session, SessionContext, SessionPhase};
use sketchdash::stores::memory::InMemoryBackend;
use sketchdash::GameConfig;

const LOG_TARGET: &str = "bin::room_demo";

#[derive(Debug, Parser)]
#[command(name = "room_demo")]
#[command(about = "Simulate a drawing round between two local clients", long_about = None)]
struct Args {
    /// Round length in seconds
    #[arg(long, default_value_t = 8)]
    round_secs: u64,

    /// Let the model win instead of the guesser
    #[arg(long, default_value_t = false)]
    model_wins: bool,
}

struct DemoSurface;

impl SketchSurface for DemoSurface {
    fn export_png(&self) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let cfg = GameConfig {
        round_duration: Duration::from_secs(args.round_secs),
        prediction_checkpoints: vec![2, 5],
        settle_delay: Duration::from_millis(300),
        ..GameConfig::default()
    };

    let store = InMemoryBackend::new();
    let hub = LocalHub::new();
    let script = vec![
        Prediction {
            label: "fruit".into(),
            confidence: 0.45,
        },
        Prediction {
            label: "banana".into(),
            confidence: 0.92,
        },
        Prediction {
            label: "banana".into(),
            confidence: 0.95,
        },
    ];
    let ctx = SessionContext {
        cfg,
        backend: store.backend(),
        channels: Arc::new(Arc::clone(&hub)) as Arc<dyn ChannelFactory>,
        prediction: Arc::new(ScriptedPredictionClient::new(script, 0.35)),
        surface: Arc::new(DemoSurface),
    };

    let code = RoomCode::parse("DEMO").context("room code")?;
    let host = Profile {
        id: Uuid::new_v4(),
        name: "Ada".into(),
        avatar: "1.png".into(),
    };
    let guest = Profile {
        id: Uuid::new_v4(),
        name: "Lin".into(),
        avatar: "3.png".into(),
    };

    Session::create_room(&ctx, &code, &host).await?;
    let _feeds = hub.wire_change_feeds(&code, &store);

    let host_session = Session::open(ctx.clone(), code.clone(), host.clone()).await?;
    let guest_session = Session::open(ctx.clone(), code.clone(), guest.clone()).await?;

    wait_for(&host_session, "roster", |view| view.active_member_count() == 2).await?;
    info!(target = LOG_TARGET, "both players are in the lobby");

    host_session.start_round().await?;
    wait_for(&host_session, "topic dialog", |view| {
        matches!(view.phase, SessionPhase::RoundSetup { .. })
    })
    .await?;

    let choices = host_session.topic_choices();
    // With --model-wins the drawer picks the word the scripted model will
    // name, so the model's label match decides the round.
    let topic = if args.model_wins { 1 } else { choices[0] };
    info!(
        target = LOG_TARGET,
        ?choices,
        chosen = topic_text(topic).unwrap_or("?"),
        "drawer picked a topic"
    );
    let round_id = host_session.choose_topic(topic).await?;

    wait_for(&guest_session, "round start", |view| {
        matches!(view.phase, SessionPhase::RoundActive { .. }) && view.current_round == Some(round_id)
    })
    .await?;

    for step in 0..4 {
        host_session
            .submit_stroke(StrokePath {
                points: vec![[step as f32, 0.0], [step as f32 + 1.0, 1.0]],
                is_eraser: false,
            })
            .await?;
    }

    guest_session.submit_guess("lighthouse").await?;
    if !args.model_wins {
        let answer = topic_text(topic).unwrap_or("banana");
        guest_session.submit_guess(answer).await?;
        info!(target = LOG_TARGET, %answer, "guesser found it");
    }

    wait_for(&guest_session, "review", |view| {
        matches!(view.phase, SessionPhase::Review { .. })
    })
    .await?;

    let summary = guest_session.review().await?;
    let outcome = match summary.round.outcome {
        RoundOutcome::GuessersWin => "the guessers win",
        RoundOutcome::ModelWins => "the model wins",
        RoundOutcome::Undecided => "nobody got it",
    };
    info!(
        target = LOG_TARGET,
        round = round_id,
        outcome,
        drawing = %summary.snapshot_url,
        "round finished"
    );
    for guess in summary.guesses {
        info!(target = LOG_TARGET, profile = %guess.profile, text = %guess.text, "recorded guess");
    }

    guest_session.close().await;
    host_session.close().await;
    Ok(())
}

async fn wait_for<F>(
    session: &Session,
    what: &str,
    mut predicate: F,
) -> Result<sketchdash::SessionView>
where
    F: FnMut(&sketchdash::SessionView) -> bool,
{
    let mut updates = session.updates();
    timeout(Duration::from_secs(30), async {
        loop {
            {
                let view = updates.borrow_and_update().clone();
                if predicate(&view) {
                    return Ok(view);
                }
            }
            if updates.changed().await.is_err() {
                anyhow::bail!("session ended while waiting for {what}");
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))?
}
