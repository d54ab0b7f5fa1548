//! Deterministic round plan built from the match's question set.

use std::time::Duration;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{MatchId, RoomKey};

use super::RoundError;

/// Opaque reference to one quiz question.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QuestionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Everything the surrounding application hands over to run one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub match_id: MatchId,
    pub questions: Vec<QuestionRef>,
    pub round_count: u32,
    pub game_time_limit: Duration,
    pub quiz_time_limit: Duration,
    pub scene_pool: Vec<String>,
    /// Replaces the match id as prefix of every round's room key.
    #[serde(default)]
    pub room_key_override: Option<String>,
}

impl MatchSpec {
    pub fn room_key(&self, round_number: u32) -> RoomKey {
        let prefix = self
            .room_key_override
            .as_deref()
            .unwrap_or(self.match_id.as_str());
        RoomKey::for_round(prefix, round_number)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoundSpec {
    /// 1-based.
    pub number: u32,
    pub questions: Vec<QuestionRef>,
    pub game_time_limit: Duration,
    pub quiz_time_limit: Duration,
    pub scene_key: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoundPlan {
    pub seed: u64,
    pub rounds: Vec<RoundSpec>,
}

impl RoundPlan {
    /// Partition the questions into ordered rounds and pick a scene per round.
    ///
    /// Identical question sets always yield identical plans, so every
    /// participant derives the same scene order without coordination.
    pub fn build(spec: &MatchSpec) -> Result<Self, RoundError> {
        if spec.questions.is_empty() {
            return Err(RoundError::InvalidMatchSpec("no questions"));
        }
        if spec.round_count == 0 {
            return Err(RoundError::InvalidMatchSpec("zero rounds"));
        }
        if spec.round_count as usize > spec.questions.len() {
            return Err(RoundError::InvalidMatchSpec("more rounds than questions"));
        }
        if spec.scene_pool.is_empty() {
            return Err(RoundError::InvalidMatchSpec("empty scene pool"));
        }

        let seed = question_seed(&spec.questions);
        let scenes = scene_sequence(seed, &spec.scene_pool, spec.round_count as usize);
        let sizes = partition_sizes(spec.questions.len(), spec.round_count as usize);

        let mut questions = spec.questions.iter();
        let rounds = sizes
            .into_iter()
            .zip(scenes)
            .enumerate()
            .map(|(index, (size, scene_key))| RoundSpec {
                number: index as u32 + 1,
                questions: questions.by_ref().take(size).cloned().collect(),
                game_time_limit: spec.game_time_limit,
                quiz_time_limit: spec.quiz_time_limit,
                scene_key,
            })
            .collect();

        Ok(Self { seed, rounds })
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn round(&self, index: usize) -> Option<&RoundSpec> {
        self.rounds.get(index)
    }

    pub fn total_questions(&self) -> usize {
        self.rounds.iter().map(|r| r.questions.len()).sum()
    }
}

/// Round sizes for `total` questions; the remainder goes to the earliest rounds.
pub fn partition_sizes(total: usize, rounds: usize) -> Vec<usize> {
    if rounds == 0 {
        return Vec::new();
    }
    let (base, remainder) = (total / rounds, total % rounds);
    (0..rounds)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// First 8 bytes of SHA-256 over the ordered question ids.
pub fn question_seed(questions: &[QuestionRef]) -> u64 {
    let mut hasher = Sha256::new();
    for question in questions {
        hasher.update(question.id.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// `count` scene keys drawn in shuffled cycles over `pool`.
///
/// Every scene is used once per cycle and, with more than one scene, the
/// same scene never plays twice in a row across a cycle boundary.
pub fn scene_sequence(seed: u64, pool: &[String], count: usize) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut sequence: Vec<String> = Vec::with_capacity(count);
    while sequence.len() < count && !pool.is_empty() {
        let mut cycle = pool.to_vec();
        cycle.shuffle(&mut rng);
        if cycle.len() > 1 && sequence.last() == cycle.first() {
            let swap_with = rng.gen_range(1..cycle.len());
            cycle.swap(0, swap_with);
        }
        let needed = count - sequence.len();
        sequence.extend(cycle.into_iter().take(needed));
    }
    sequence
}
