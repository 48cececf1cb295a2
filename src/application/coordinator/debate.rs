//! Debate refinement stage.
//!
//! After the first aggregation round, agents whose vote disagrees with the
//! weighted majority receive a digest of the other agents' reasons and may
//! revise. At most three rounds; the debate ends early once all signs agree
//! or no dissenter changes its vote. Only the *inputs* to the final weighted
//! vote change; the aggregation math itself is untouched.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_ROUNDS: usize = 3;
const DIGEST_CAP: usize = 10;

pub struct DebateEngine {
    max_rounds: usize,
}

impl DebateEngine {
    pub fn new() -> Self {
        Self {
            max_rounds: MAX_ROUNDS,
        }
    }

    fn weighted_total(outputs: &[AgentOutput], weights: &HashMap<String, f64>) -> f64 {
        outputs
            .iter()
            .map(|o| weights.get(&o.agent).copied().unwrap_or(0.0) * o.score)
            .sum()
    }

    /// Indices of agents voting against the current majority sign.
    fn dissenters(outputs: &[AgentOutput], majority_sign: f64) -> Vec<usize> {
        outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.score.abs() >= 0.1 && o.score.signum() != majority_sign)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn digest(outputs: &[AgentOutput], exclude: &[usize]) -> Vec<String> {
        outputs
            .iter()
            .enumerate()
            .filter(|(idx, _)| !exclude.contains(idx))
            .flat_map(|(_, o)| {
                o.reasons
                    .iter()
                    .map(move |r| format!("{}: {}", o.agent, r))
            })
            .take(DIGEST_CAP)
            .collect()
    }

    pub async fn refine(
        &self,
        agents: &[Arc<dyn Agent>],
        ctx: &AgentContext,
        mut outputs: Vec<AgentOutput>,
        weights: &HashMap<String, f64>,
        deadline: Duration,
    ) -> Vec<AgentOutput> {
        for round in 0..self.max_rounds {
            let total = Self::weighted_total(&outputs, weights);
            if total == 0.0 {
                break;
            }
            let majority_sign = total.signum();

            let dissenters = Self::dissenters(&outputs, majority_sign);
            if dissenters.is_empty() {
                debug!("Debate: consensus after {} round(s)", round);
                break;
            }

            let digest = Self::digest(&outputs, &dissenters);
            let mut changed = false;

            for idx in dissenters {
                let agent = &agents[idx];
                let revised = tokio::time::timeout(
                    deadline,
                    agent.revise(ctx.clone(), &outputs[idx], &digest),
                )
                .await
                .ok()
                .flatten();

                if let Some(revised) = revised {
                    if revised.score != outputs[idx].score {
                        debug!(
                            "Debate: '{}' revised {:.2} -> {:.2}",
                            revised.agent, outputs[idx].score, revised.score
                        );
                        outputs[idx] = revised;
                        changed = true;
                    }
                }
            }

            // Positions stabilised: nobody moved, further rounds are moot.
            if !changed {
                debug!("Debate: positions stabilised after round {}", round + 1);
                break;
            }
        }
        outputs
    }
}

impl Default for DebateEngine {
    fn default() -> Self {
        Self::new()
    }
}
