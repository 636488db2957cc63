use tracing::info;

use crate::models::{Action, LayerKind, ModerationResult, ModerationVerdict};

/// Chosen enforcement for a single message plus every verdict it displaced.
#[derive(Debug, Clone)]
pub struct PunishmentDecision {
    pub verdict: ModerationVerdict,
    pub conflicting: Vec<ModerationVerdict>,
}

impl PunishmentDecision {
    pub fn action(&self) -> Action {
        self.verdict.action
    }
}

/// Reconciles the verdict set for one message. A contextual hit carries more
/// confidence about intent than a category flag, which in turn beats a bare
/// keyword match; within a layer the priority bucket wins.
#[derive(Debug, Default)]
pub struct PunishmentAggregator;

fn layer_rank(layer: LayerKind) -> u8 {
    match layer {
        LayerKind::Regex => 1,
        LayerKind::Category => 2,
        LayerKind::Contextual => 3,
    }
}

impl PunishmentAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(&self, results: &[ModerationResult]) -> Option<PunishmentDecision> {
        let mut best: Option<ModerationVerdict> = None;
        let mut conflicts: Vec<ModerationVerdict> = Vec::new();

        for result in results {
            let Some(verdict) = &result.verdict else {
                continue;
            };
            if !verdict.violated {
                continue;
            }
            match &mut best {
                None => best = Some(verdict.clone()),
                Some(current) if is_better(verdict, current) => {
                    conflicts.push(std::mem::replace(current, verdict.clone()));
                }
                Some(_) => conflicts.push(verdict.clone()),
            }
        }

        let best = best?;
        info!(
            action = %best.action,
            rule = %best.rule_code,
            layer = %best.layer,
            priority = best.priority.rank(),
            conflicts = conflicts.len(),
            "punishment decision"
        );
        Some(PunishmentDecision {
            verdict: best,
            conflicting: conflicts,
        })
    }
}

fn is_better(candidate: &ModerationVerdict, current: &ModerationVerdict) -> bool {
    (layer_rank(candidate.layer), candidate.priority.rank())
        > (layer_rank(current.layer), current.priority.rank())
}
