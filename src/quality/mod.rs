//! Quality scoring for generated QA pairs.
//!
//! A pair is scored on four weighted criteria: question form, answer
//! substance, grounding in the source segment and domain relevance. The
//! orchestrator accepts a pair iff its score reaches the configured threshold;
//! a pair that cannot be scored is rejected.

mod scorer;

pub use scorer::{
    default_domain_keywords, HeuristicScorer, QualityScorer, ScoreBreakdown, ScoringCriteria,
};
