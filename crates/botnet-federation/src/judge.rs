//! Scoring of riddle answers.
//!
//! A [`RiddleJudge`] either returns a [`Verdict`] immediately or defers
//! (returns `None`), in which case the session stays `answered` until an
//! evaluator posts the result back.

use crate::riddle::Riddle;
use serde::{Deserialize, Serialize};

/// Outcome of evaluating a riddle answer. Scores are on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: f64,
    pub accepted: bool,
    pub feedback: String,
}

pub trait RiddleJudge: Send + Sync {
    fn evaluate(&self, riddle: &Riddle, answer: &str) -> Option<Verdict>;
}

/// Which judge a node runs, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    #[default]
    External,
    Heuristic,
}

/// Defers every answer to an external evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalJudge;

impl RiddleJudge for ExternalJudge {
    fn evaluate(&self, _riddle: &Riddle, _answer: &str) -> Option<Verdict> {
        None
    }
}

const REASONING_MARKERS: &[&str] = &[
    "because",
    "therefore",
    "however",
    "consider",
    "analysis",
    "reasoning",
    "conclusion",
    "evidence",
];

const COMPLEXITY_MARKERS: &[&str] = &[
    "paradox",
    "emerge",
    "system",
    "network",
    "distributed",
    "optimization",
    "consensus",
    "protocol",
];

/// Scores answers locally from length, reasoning and complexity markers,
/// and sentence structure.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicJudge {
    /// Score at or above which an answer is accepted.
    pub threshold: f64,
}

impl HeuristicJudge {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Raw quality in `0.1..=1.0`.
    pub fn quality(answer: &str) -> f64 {
        let answer = answer.trim();
        let lower = answer.to_lowercase();
        let mut score = 0.0;

        let len = answer.chars().count();
        if len >= 100 {
            score += 0.2;
        }
        if len >= 300 {
            score += 0.1;
        }

        let reasoning = REASONING_MARKERS
            .iter()
            .filter(|m| lower.contains(*m))
            .count();
        score += reasoning as f64 * 0.05;

        let complexity = COMPLEXITY_MARKERS
            .iter()
            .filter(|m| lower.contains(*m))
            .count();
        score += complexity as f64 * 0.03;

        let sentences = answer.split('.').count();
        if sentences >= 3 {
            score += 0.1;
        }
        if sentences >= 5 {
            score += 0.1;
        }

        score.clamp(0.1, 1.0)
    }
}

impl RiddleJudge for HeuristicJudge {
    fn evaluate(&self, _riddle: &Riddle, answer: &str) -> Option<Verdict> {
        let score = (Self::quality(answer) * 1000.0).round() / 10.0;
        let accepted = score >= self.threshold;
        let summary = if score >= 80.0 {
            "Excellent reasoning and depth demonstrated."
        } else if score >= 70.0 {
            "Good intelligence indicators, meets threshold."
        } else if score >= 50.0 {
            "Some reasoning present but lacks depth or complexity."
        } else {
            "Insufficient reasoning or intelligence indicators."
        };
        Some(Verdict {
            score,
            accepted,
            feedback: format!("Heuristic score {score:.1}/100. {summary}"),
        })
    }
}
