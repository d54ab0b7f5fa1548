//! Per-round and aggregate quiz scores.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RoundSettings;

/// Quiz outcome of one round as reported by the minigame's scoring surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundScore {
    pub correct: u32,
    pub total: u32,
    pub elapsed: Duration,
}

impl RoundScore {
    pub fn new(correct: u32, total: u32) -> Self {
        Self {
            correct,
            total,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: u32,
    pub correct: u32,
    pub total: u32,
    pub weighted_score: f32,
    pub scene_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResults {
    /// Plain number of correct answers.
    pub score: u32,
    pub total_questions: u32,
    pub percentage: f32,
    pub weighted_score: f32,
    pub rounds: Vec<RoundResult>,
}

/// `correct × max(min_multiplier, 1 − penalty_rate × elapsed / quiz_limit)`.
pub fn weighted_score(score: &RoundScore, quiz_time_limit: Duration, settings: &RoundSettings) -> f32 {
    let limit = quiz_time_limit.as_secs_f32();
    let spent = if limit > 0.0 {
        score.elapsed.as_secs_f32() / limit
    } else {
        0.0
    };
    let multiplier = (1.0 - settings.penalty_rate * spent).max(settings.min_multiplier);
    score.correct as f32 * multiplier
}

/// Running tally of finished rounds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoreBoard {
    rounds: Vec<RoundResult>,
}

impl ScoreBoard {
    pub fn record(&mut self, result: RoundResult) {
        self.rounds.push(result);
    }

    pub fn score(&self) -> u32 {
        self.rounds.iter().map(|r| r.correct).sum()
    }

    pub fn rounds(&self) -> &[RoundResult] {
        &self.rounds
    }

    pub fn results(&self, total_questions: u32) -> MatchResults {
        let score = self.score();
        let percentage = if total_questions == 0 {
            0.0
        } else {
            score as f32 * 100.0 / total_questions as f32
        };
        MatchResults {
            score,
            total_questions,
            percentage,
            weighted_score: self.rounds.iter().map(|r| r.weighted_score).sum(),
            rounds: self.rounds.clone(),
        }
    }
}
