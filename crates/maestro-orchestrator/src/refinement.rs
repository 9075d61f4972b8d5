//! Generator/critic iteration as an explicit state machine.
//!
//! The executor asks [`Refinement`] what to dispatch next and feeds each
//! critic verdict back in. All termination logic lives here, so it can be
//! tested without running any handler.

use crate::handler::HandlerError;
use crate::types::{IterationRecord, LoopConfig};
use serde_json::{json, Value};

/// What a critic said about one generator output.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticVerdict {
    pub score: f64,
    pub feedback: Option<String>,
}

impl CriticVerdict {
    /// Read a verdict from a critic's output.
    ///
    /// The score is `score` when present, otherwise the mean of the numeric
    /// values in a `quality_scores` object. Feedback is `feedback` as a
    /// string, otherwise the entries of a `recommendations` array joined by
    /// newlines.
    pub fn from_output(output: &Value) -> Result<Self, HandlerError> {
        let score = match output.get("score").and_then(Value::as_f64) {
            Some(score) => score,
            None => mean_quality_score(output).ok_or_else(|| {
                HandlerError::logic(
                    "critic output has neither a numeric `score` nor `quality_scores`",
                )
            })?,
        };
        if !score.is_finite() {
            return Err(HandlerError::logic(format!("critic score {score} is not finite")));
        }

        let feedback = match output.get("feedback") {
            Some(Value::String(text)) => Some(text.clone()),
            _ => output
                .get("recommendations")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .filter(|text| !text.is_empty()),
        };

        Ok(Self { score, feedback })
    }
}

fn mean_quality_score(output: &Value) -> Option<f64> {
    let scores: Vec<f64> = output
        .get("quality_scores")?
        .as_object()?
        .values()
        .filter_map(Value::as_f64)
        .collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Result of feeding a verdict into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Threshold met; stop with the latest output.
    Accept,
    /// Below threshold with budget left; dispatch the generator again.
    Continue,
    /// Budget spent without meeting the threshold; stop with the best output.
    Exhausted,
}

#[derive(Debug, Clone)]
struct Best {
    iteration: u32,
    score: f64,
    output: Value,
}

/// Iteration state of one loop run.
#[derive(Debug, Clone)]
pub struct Refinement {
    threshold: f64,
    max_iterations: u32,
    input: Value,
    iteration: u32,
    history: Vec<IterationRecord>,
    best: Option<Best>,
}

impl Refinement {
    pub fn new(config: &LoopConfig, input: Value) -> Self {
        Self {
            threshold: config.threshold,
            max_iterations: config.max_iterations,
            input,
            iteration: 0,
            history: Vec::new(),
            best: None,
        }
    }

    /// Iterations started so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Start the next iteration and return the generator's context, or
    /// `None` once the budget is spent.
    ///
    /// The first generator sees the initial input; later ones see the input
    /// together with the previous output and the critic's feedback.
    pub fn begin_iteration(&mut self) -> Option<Value> {
        if self.iteration >= self.max_iterations {
            return None;
        }
        self.iteration += 1;
        Some(match self.history.last() {
            None => self.input.clone(),
            Some(previous) => json!({
                "input": self.input,
                "previous_output": previous.output,
                "feedback": previous.feedback,
                "score": previous.score,
                "iteration": self.iteration,
            }),
        })
    }

    /// Context handed to the critic for the current iteration's output.
    pub fn critic_context(&self, output: &Value) -> Value {
        json!({
            "output": output,
            "iteration": self.iteration,
            "threshold": self.threshold,
        })
    }

    /// Record the current iteration's output and verdict.
    pub fn record(&mut self, output: Value, verdict: CriticVerdict) -> Decision {
        let improved = self.best.as_ref().map_or(true, |b| verdict.score > b.score);
        if improved {
            self.best = Some(Best {
                iteration: self.iteration,
                score: verdict.score,
                output: output.clone(),
            });
        }
        self.history.push(IterationRecord {
            iteration: self.iteration,
            output,
            score: verdict.score,
            feedback: verdict.feedback,
        });

        if verdict.score >= self.threshold {
            Decision::Accept
        } else if self.iteration >= self.max_iterations {
            Decision::Exhausted
        } else {
            Decision::Continue
        }
    }

    /// Output of the most recent iteration.
    pub fn latest_output(&self) -> Option<&Value> {
        self.history.last().map(|r| &r.output)
    }

    /// Output of the highest-scoring iteration; the earliest wins ties.
    pub fn best_output(&self) -> Option<&Value> {
        self.best.as_ref().map(|b| &b.output)
    }

    /// Iteration number of [`best_output`](Self::best_output).
    pub fn best_iteration(&self) -> Option<u32> {
        self.best.as_ref().map(|b| b.iteration)
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<IterationRecord> {
        self.history
    }
}
