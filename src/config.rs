use std::time::Duration;

/// Tunables for the round lifecycle. Every client in a room should run the
/// same configuration; the countdown itself is seeded locally and is never
/// synchronized across clients.
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Fallback round length when the room row does not carry one.
    pub round_duration: Duration,
    /// Elapsed-time marks (seconds into the round) at which the drawer's
    /// client requests an AI prediction.
    pub prediction_checkpoints: Vec<u32>,
    /// Pause between the drawer finishing a round and the review broadcast,
    /// so the final stroke and guess writes have time to fan out.
    pub settle_delay: Duration,
    /// Minimum connected members required to start a round.
    pub min_players: usize,
    /// Number of distinct topics offered to the drawer.
    pub topic_choices: usize,
    /// Score awarded to the member whose guess decides the round.
    pub guesser_award: i64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_secs(45),
            prediction_checkpoints: vec![5, 15, 25, 35],
            settle_delay: Duration::from_secs(2),
            min_players: 2,
            topic_choices: 3,
            guesser_award: 100,
        }
    }
}

impl GameConfig {
    pub fn round_duration_secs(&self) -> u32 {
        self.round_duration.as_secs() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_checkpoints_fit_inside_round() {
        let cfg = GameConfig::default();
        for mark in &cfg.prediction_checkpoints {
            assert!(*mark < cfg.round_duration_secs());
        }
    }
}
