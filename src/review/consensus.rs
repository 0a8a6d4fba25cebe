//! Iterative consensus among parallel reviewers.
//!
//! A round reaches consensus when no reviewer raises a blocking concern and
//! either everyone approves or, with unanimity switched off, the approval
//! ratio meets the configured threshold. Otherwise the manager builds a
//! context for the next round and asks the [`RoundExecutor`] for fresh
//! outputs, up to `max_iterations` rounds in total.

use crate::config::ConsensusSection;
use crate::logging::Logger;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Perspective a reviewer reviews from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRole {
    TechLead,
    Security,
    ProductOwner,
}

impl ReviewerRole {
    pub const ALL: [ReviewerRole; 3] = [
        ReviewerRole::TechLead,
        ReviewerRole::Security,
        ReviewerRole::ProductOwner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechLead => "tech_lead",
            Self::Security => "security",
            Self::ProductOwner => "product_owner",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::TechLead => "Tech Lead",
            Self::Security => "Security",
            Self::ProductOwner => "Product Owner",
        }
    }
}

impl fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concern {
    pub description: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Concern {
    pub fn blocking(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            blocking: true,
            file: None,
        }
    }

    pub fn advisory(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            blocking: false,
            file: None,
        }
    }

    /// Key used to spot the same concern raised by several reviewers.
    fn key(&self) -> String {
        let text: String = self
            .description
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match &self.file {
            Some(file) => format!("{}::{}", file, text),
            None => text,
        }
    }
}

/// One reviewer's verdict for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerOutput {
    pub role: ReviewerRole,
    pub approved: bool,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub summary: String,
    /// Round that produced this output, starting at 1.
    #[serde(default)]
    pub iteration: u32,
}

impl ReviewerOutput {
    pub fn approve(role: ReviewerRole) -> Self {
        Self {
            role,
            approved: true,
            concerns: Vec::new(),
            summary: String::new(),
            iteration: 0,
        }
    }

    pub fn reject(role: ReviewerRole, concerns: Vec<Concern>) -> Self {
        Self {
            role,
            approved: false,
            concerns,
            summary: String::new(),
            iteration: 0,
        }
    }

    pub fn blocking_concerns(&self) -> impl Iterator<Item = &Concern> {
        self.concerns.iter().filter(|c| c.blocking)
    }
}

/// A concern raised by two or more reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConcern {
    pub description: String,
    pub raised_by: Vec<ReviewerRole>,
    pub blocking: bool,
}

/// Input for the next review round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundContext {
    pub iteration: u32,
    pub previous_summary: String,
    /// Concerns raised by at least two reviewers; these come first.
    pub shared_concerns: Vec<SharedConcern>,
    pub concerns_by_reviewer: BTreeMap<ReviewerRole, Vec<Concern>>,
}

impl RoundContext {
    pub fn initial() -> Self {
        Self {
            iteration: 1,
            ..Self::default()
        }
    }

    /// Render as markdown for reviewer prompts.
    pub fn render(&self) -> String {
        let mut out = format!("## Review round {}\n\n", self.iteration);
        if !self.previous_summary.is_empty() {
            out.push_str("### Previous round\n\n");
            out.push_str(&self.previous_summary);
            out.push_str("\n\n");
        }
        if !self.shared_concerns.is_empty() {
            out.push_str("### Raised by several reviewers\n\n");
            for shared in &self.shared_concerns {
                let roles: Vec<&str> = shared.raised_by.iter().map(|r| r.display_name()).collect();
                out.push_str(&format!(
                    "- {}{} ({})\n",
                    if shared.blocking { "[blocking] " } else { "" },
                    shared.description,
                    roles.join(", ")
                ));
            }
            out.push('\n');
        }
        for (role, concerns) in &self.concerns_by_reviewer {
            if concerns.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n\n", role.display_name()));
            for concern in concerns {
                out.push_str(&format!(
                    "- {}{}\n",
                    if concern.blocking { "[blocking] " } else { "" },
                    concern.description
                ));
            }
            out.push('\n');
        }
        out
    }
}

/// Produces the outputs of one review round.
#[async_trait]
pub trait RoundExecutor: Send + Sync {
    async fn run_round(&self, context: &RoundContext) -> Result<Vec<ReviewerOutput>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedConcern {
    pub role: ReviewerRole,
    pub concern: Concern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub reached: bool,
    pub iterations: u32,
    pub final_outputs: Vec<ReviewerOutput>,
    pub unresolved_concerns: Vec<UnresolvedConcern>,
    pub requires_human_review: bool,
}

pub struct ConsensusManager {
    max_iterations: u32,
    require_unanimous: bool,
    approval_threshold: f64,
    logger: Logger,
}

impl ConsensusManager {
    pub fn new(config: &ConsensusSection, logger: Logger) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            require_unanimous: config.require_unanimous,
            approval_threshold: config.approval_threshold,
            logger,
        }
    }

    /// Whether one round's outputs amount to consensus.
    pub fn is_reached(&self, outputs: &[ReviewerOutput]) -> bool {
        if outputs.is_empty() {
            return false;
        }
        if outputs.iter().any(|o| o.blocking_concerns().next().is_some()) {
            return false;
        }
        let approvals = outputs.iter().filter(|o| o.approved).count();
        if approvals == outputs.len() {
            return true;
        }
        !self.require_unanimous
            && (approvals as f64 / outputs.len() as f64) >= self.approval_threshold
    }

    pub fn build_round_context(&self, outputs: &[ReviewerOutput], iteration: u32) -> RoundContext {
        let approvals = outputs.iter().filter(|o| o.approved).count();
        let mut summary = format!(
            "Round {}: {}/{} reviewers approved.",
            iteration.saturating_sub(1),
            approvals,
            outputs.len()
        );
        for output in outputs {
            let verdict = if output.approved { "approved" } else { "did not approve" };
            summary.push_str(&format!("\n- {} {}", output.role.display_name(), verdict));
            if !output.summary.trim().is_empty() {
                summary.push_str(&format!(": {}", output.summary.trim()));
            }
        }

        let mut grouped: BTreeMap<String, SharedConcern> = BTreeMap::new();
        for output in outputs {
            for concern in &output.concerns {
                let entry = grouped.entry(concern.key()).or_insert_with(|| SharedConcern {
                    description: concern.description.clone(),
                    raised_by: Vec::new(),
                    blocking: false,
                });
                if !entry.raised_by.contains(&output.role) {
                    entry.raised_by.push(output.role);
                }
                entry.blocking |= concern.blocking;
            }
        }
        let mut shared: Vec<SharedConcern> = grouped
            .into_values()
            .filter(|c| c.raised_by.len() >= 2)
            .collect();
        shared.sort_by(|a, b| {
            b.blocking
                .cmp(&a.blocking)
                .then_with(|| b.raised_by.len().cmp(&a.raised_by.len()))
                .then_with(|| a.description.cmp(&b.description))
        });

        let mut concerns_by_reviewer = BTreeMap::new();
        for output in outputs {
            concerns_by_reviewer
                .entry(output.role)
                .or_insert_with(Vec::new)
                .extend(output.concerns.iter().cloned());
        }

        RoundContext {
            iteration,
            previous_summary: summary,
            shared_concerns: shared,
            concerns_by_reviewer,
        }
    }

    /// Drive rounds until consensus, exhaustion, or an executor error.
    pub async fn seek_consensus(
        &self,
        initial_outputs: Vec<ReviewerOutput>,
        executor: &dyn RoundExecutor,
    ) -> ConsensusResult {
        let mut outputs = stamp(initial_outputs, 1);
        let mut iteration = 1;

        loop {
            if self.is_reached(&outputs) {
                self.logger
                    .info(format!("Consensus reached in round {}", iteration));
                return ConsensusResult {
                    reached: true,
                    iterations: iteration,
                    final_outputs: outputs,
                    unresolved_concerns: Vec::new(),
                    requires_human_review: false,
                };
            }
            if iteration >= self.max_iterations {
                break;
            }

            let context = self.build_round_context(&outputs, iteration + 1);
            self.logger.debug(format!(
                "No consensus in round {}; starting round {} with {} shared concerns",
                iteration,
                iteration + 1,
                context.shared_concerns.len()
            ));
            match executor.run_round(&context).await {
                Ok(next) => {
                    iteration += 1;
                    outputs = stamp(next, iteration);
                }
                Err(e) => {
                    self.logger
                        .warn(format!("Review round {} failed: {:#}", iteration + 1, e));
                    let unresolved = unresolved_blockers(&outputs);
                    return ConsensusResult {
                        reached: false,
                        iterations: iteration,
                        final_outputs: outputs,
                        unresolved_concerns: unresolved,
                        requires_human_review: true,
                    };
                }
            }
        }

        let unresolved = unresolved_blockers(&outputs);
        self.logger.warn(format!(
            "No consensus after {} rounds ({} blocking concerns remain)",
            iteration,
            unresolved.len()
        ));
        ConsensusResult {
            reached: false,
            iterations: iteration,
            requires_human_review: !unresolved.is_empty(),
            final_outputs: outputs,
            unresolved_concerns: unresolved,
        }
    }
}

fn stamp(mut outputs: Vec<ReviewerOutput>, iteration: u32) -> Vec<ReviewerOutput> {
    for output in &mut outputs {
        output.iteration = iteration;
    }
    outputs
}

fn unresolved_blockers(outputs: &[ReviewerOutput]) -> Vec<UnresolvedConcern> {
    outputs
        .iter()
        .flat_map(|o| {
            o.blocking_concerns().map(|c| UnresolvedConcern {
                role: o.role,
                concern: c.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedRounds {
        rounds: Mutex<VecDeque<Result<Vec<ReviewerOutput>>>>,
        seen: Mutex<Vec<RoundContext>>,
    }

    impl ScriptedRounds {
        fn new(rounds: Vec<Result<Vec<ReviewerOutput>>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RoundExecutor for ScriptedRounds {
        async fn run_round(&self, context: &RoundContext) -> Result<Vec<ReviewerOutput>> {
            self.seen.lock().unwrap().push(context.clone());
            self.rounds
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no more rounds scripted")))
        }
    }

    fn manager(require_unanimous: bool) -> ConsensusManager {
        ConsensusManager::new(
            &ConsensusSection {
                max_iterations: 3,
                require_unanimous,
                approval_threshold: 0.6,
            },
            Logger::disabled(),
        )
    }

    fn all_approve() -> Vec<ReviewerOutput> {
        ReviewerRole::ALL.iter().map(|r| ReviewerOutput::approve(*r)).collect()
    }

    fn security_blocks(concern: &str) -> Vec<ReviewerOutput> {
        vec![
            ReviewerOutput::approve(ReviewerRole::TechLead),
            ReviewerOutput::reject(ReviewerRole::Security, vec![Concern::blocking(concern)]),
            ReviewerOutput::approve(ReviewerRole::ProductOwner),
        ]
    }

    #[tokio::test]
    async fn test_unanimous_approval_in_first_round() {
        let executor = ScriptedRounds::new(vec![]);
        let result = manager(true).seek_consensus(all_approve(), &executor).await;
        assert!(result.reached);
        assert_eq!(result.iterations, 1);
        assert!(!result.requires_human_review);
        assert!(executor.seen.lock().unwrap().is_empty());
        assert!(result.final_outputs.iter().all(|o| o.iteration == 1));
    }

    #[tokio::test]
    async fn test_disapproval_resolved_in_second_round() {
        let executor = ScriptedRounds::new(vec![Ok(all_approve())]);
        let result = manager(true)
            .seek_consensus(security_blocks("SQL injection in search"), &executor)
            .await;
        assert!(result.reached);
        assert_eq!(result.iterations, 2);
        assert!(result.final_outputs.iter().all(|o| o.iteration == 2));

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].iteration, 2);
        assert_eq!(
            seen[0].concerns_by_reviewer[&ReviewerRole::Security][0].description,
            "SQL injection in search"
        );
    }

    #[tokio::test]
    async fn test_persistent_blocker_requires_human_review() {
        let executor = ScriptedRounds::new(vec![
            Ok(security_blocks("secrets logged")),
            Ok(security_blocks("secrets logged")),
        ]);
        let result = manager(true)
            .seek_consensus(security_blocks("secrets logged"), &executor)
            .await;
        assert!(!result.reached);
        assert_eq!(result.iterations, 3);
        assert!(result.requires_human_review);
        assert_eq!(result.unresolved_concerns.len(), 1);
        assert_eq!(result.unresolved_concerns[0].role, ReviewerRole::Security);
    }

    #[tokio::test]
    async fn test_executor_error_returns_current_blockers_only() {
        let mut first = security_blocks("old concern");
        first[0] = ReviewerOutput::reject(
            ReviewerRole::TechLead,
            vec![Concern::blocking("missing tests")],
        );
        let executor = ScriptedRounds::new(vec![
            Ok(security_blocks("new concern")),
            Err(anyhow::anyhow!("reviewer crashed")),
        ]);
        let result = manager(true).seek_consensus(first, &executor).await;
        assert!(!result.reached);
        assert!(result.requires_human_review);
        assert_eq!(result.iterations, 2);
        let descriptions: Vec<&str> = result
            .unresolved_concerns
            .iter()
            .map(|u| u.concern.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["new concern"]);
    }

    #[test]
    fn test_blocking_concern_prevents_consensus_even_if_approved() {
        let mut outputs = all_approve();
        outputs[0].concerns.push(Concern::blocking("breaks API"));
        assert!(!manager(false).is_reached(&outputs));
    }

    #[test]
    fn test_threshold_without_unanimity() {
        let outputs = vec![
            ReviewerOutput::approve(ReviewerRole::TechLead),
            ReviewerOutput::approve(ReviewerRole::Security),
            ReviewerOutput::reject(
                ReviewerRole::ProductOwner,
                vec![Concern::advisory("copy could be clearer")],
            ),
        ];
        assert!(manager(false).is_reached(&outputs));
        assert!(!manager(true).is_reached(&outputs));
        assert!(!manager(false).is_reached(&[]));
    }

    #[test]
    fn test_shared_concerns_come_first() {
        let outputs = vec![
            ReviewerOutput::reject(
                ReviewerRole::TechLead,
                vec![Concern::blocking("No input validation"), Concern::advisory("naming")],
            ),
            ReviewerOutput::reject(
                ReviewerRole::Security,
                vec![Concern::advisory("no  input validation")],
            ),
            ReviewerOutput::approve(ReviewerRole::ProductOwner),
        ];
        let context = manager(true).build_round_context(&outputs, 2);
        assert_eq!(context.shared_concerns.len(), 1);
        let shared = &context.shared_concerns[0];
        assert!(shared.blocking);
        assert_eq!(
            shared.raised_by,
            vec![ReviewerRole::TechLead, ReviewerRole::Security]
        );
        assert!(context.previous_summary.contains("1/3 reviewers approved"));

        let rendered = context.render();
        let shared_at = rendered.find("Raised by several reviewers").unwrap();
        let per_reviewer_at = rendered.find("### Tech Lead").unwrap();
        assert!(shared_at < per_reviewer_at);
    }
}
