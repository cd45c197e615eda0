//! Heuristic quality scoring for generated QA pairs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ScoringError;
use crate::pipeline::types::QaPair;

/// Default weight for the question-form component.
const DEFAULT_QUESTION_WEIGHT: f64 = 0.2;

/// Default weight for the answer-substance component.
const DEFAULT_ANSWER_WEIGHT: f64 = 0.3;

/// Default weight for grounding in the source segment.
const DEFAULT_GROUNDING_WEIGHT: f64 = 0.3;

/// Default weight for domain relevance.
const DEFAULT_DOMAIN_WEIGHT: f64 = 0.2;

/// Domain keyword hits needed for a full relevance score.
const DOMAIN_HITS_FOR_FULL_SCORE: usize = 2;

const INTERROGATIVES: &[&str] = &[
    "what", "why", "how", "which", "when", "where", "who", "whose", "describe", "explain",
    "compare", "什么", "为什么", "如何", "怎样", "怎么", "哪", "是否", "多少", "请说明", "请解释",
];

/// Returns the default semiconductor-display vocabulary.
pub fn default_domain_keywords() -> Vec<String> {
    [
        "display", "oled", "amoled", "lcd", "tft", "pixel", "panel", "backplane", "ltps", "igzo",
        "oxide", "micro led", "mini led", "quantum dot", "polarizer", "luminance", "brightness",
        "contrast", "gamut", "refresh rate", "driver ic", "substrate", "encapsulation",
        "mura", "backlight", "liquid crystal", "emitter", "aperture ratio", "显示", "像素",
        "面板", "薄膜晶体管", "背板", "亮度", "色域", "偏光片", "量子点", "封装", "驱动",
        "基板", "有机发光", "液晶", "背光", "刷新率", "开口率", "发光",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Capability interface for scoring a QA pair.
///
/// Implementations must be deterministic for identical pair content, source
/// segment and criteria. The returned score lies in [0, 1].
pub trait QualityScorer: Send + Sync {
    fn score(&self, pair: &QaPair, source_segment: &str) -> Result<f64, ScoringError>;
}

/// Configurable criteria for [`HeuristicScorer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringCriteria {
    pub question_weight: f64,
    pub answer_weight: f64,
    pub grounding_weight: f64,
    pub domain_weight: f64,
    pub min_question_chars: usize,
    pub min_answer_chars: usize,
    pub max_answer_chars: usize,
    pub domain_keywords: Vec<String>,
}

impl Default for ScoringCriteria {
    fn default() -> Self {
        Self {
            question_weight: DEFAULT_QUESTION_WEIGHT,
            answer_weight: DEFAULT_ANSWER_WEIGHT,
            grounding_weight: DEFAULT_GROUNDING_WEIGHT,
            domain_weight: DEFAULT_DOMAIN_WEIGHT,
            min_question_chars: 6,
            min_answer_chars: 10,
            max_answer_chars: 1500,
            domain_keywords: default_domain_keywords(),
        }
    }
}

impl ScoringCriteria {
    fn total_weight(&self) -> f64 {
        self.question_weight.max(0.0)
            + self.answer_weight.max(0.0)
            + self.grounding_weight.max(0.0)
            + self.domain_weight.max(0.0)
    }
}

/// Per-component breakdown of a score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub question_form: f64,
    pub answer_substance: f64,
    pub grounding: f64,
    pub domain_relevance: f64,
    pub overall: f64,
}

/// Default scorer combining weighted heuristics.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    criteria: ScoringCriteria,
    keywords: Vec<String>,
}

impl HeuristicScorer {
    pub fn new(criteria: ScoringCriteria) -> Self {
        let keywords = criteria
            .domain_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        Self { criteria, keywords }
    }

    pub fn with_defaults() -> Self {
        Self::new(ScoringCriteria::default())
    }

    pub fn criteria(&self) -> &ScoringCriteria {
        &self.criteria
    }

    /// Scores a pair and returns every component.
    pub fn breakdown(&self, pair: &QaPair, source_segment: &str) -> Result<ScoreBreakdown, ScoringError> {
        let question = pair.question.trim();
        let answer = pair.answer.trim();
        if question.is_empty() {
            return Err(ScoringError::EmptyQuestion);
        }
        if answer.is_empty() {
            return Err(ScoringError::EmptyAnswer);
        }

        let total = self.criteria.total_weight();
        if total <= 0.0 {
            return Err(ScoringError::ZeroWeights);
        }

        let question_form = self.question_form(question);
        let answer_substance = self.answer_substance(question, answer);
        let grounding = grounding(answer, source_segment);
        let domain_relevance = self.domain_relevance(question, answer);

        let c = &self.criteria;
        let overall = (c.question_weight.max(0.0) * question_form
            + c.answer_weight.max(0.0) * answer_substance
            + c.grounding_weight.max(0.0) * grounding
            + c.domain_weight.max(0.0) * domain_relevance)
            / total;

        Ok(ScoreBreakdown {
            question_form,
            answer_substance,
            grounding,
            domain_relevance,
            overall: overall.clamp(0.0, 1.0),
        })
    }

    fn question_form(&self, question: &str) -> f64 {
        if question.chars().count() < self.criteria.min_question_chars {
            return 0.0;
        }
        let lower = question.to_lowercase();
        let is_question = lower.ends_with('?')
            || lower.ends_with('？')
            || INTERROGATIVES.iter().any(|w| lower.starts_with(w));
        if is_question {
            1.0
        } else {
            0.5
        }
    }

    fn answer_substance(&self, question: &str, answer: &str) -> f64 {
        if answer.eq_ignore_ascii_case(question) {
            return 0.0;
        }
        let len = answer.chars().count() as f64;
        let min = self.criteria.min_answer_chars.max(1) as f64;
        let max = self.criteria.max_answer_chars.max(self.criteria.min_answer_chars).max(1) as f64;
        if len < min {
            len / min
        } else if len > max {
            max / len
        } else {
            1.0
        }
    }

    fn domain_relevance(&self, question: &str, answer: &str) -> f64 {
        if self.keywords.is_empty() {
            return 1.0;
        }
        let text = format!("{} {}", question, answer).to_lowercase();
        let hits = self
            .keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .count();
        (hits as f64 / DOMAIN_HITS_FOR_FULL_SCORE as f64).min(1.0)
    }
}

impl QualityScorer for HeuristicScorer {
    fn score(&self, pair: &QaPair, source_segment: &str) -> Result<f64, ScoringError> {
        self.breakdown(pair, source_segment).map(|b| b.overall)
    }
}

/// Share of the answer's terms that also occur in the source.
///
/// An empty source gives a neutral 0.5.
fn grounding(answer: &str, source: &str) -> f64 {
    let source_terms = terms(source);
    if source_terms.is_empty() {
        return 0.5;
    }
    let answer_terms = terms(answer);
    if answer_terms.is_empty() {
        return 0.0;
    }
    let shared = answer_terms.intersection(&source_terms).count();
    shared as f64 / answer_terms.len() as f64
}

/// Lowercased latin words of 3+ chars plus CJK character bigrams.
fn terms(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let lower = text.to_lowercase();

    for word in lower.split(|c: char| !c.is_ascii_alphanumeric()) {
        if word.len() >= 3 {
            out.insert(word.to_string());
        }
    }

    let cjk: Vec<char> = lower
        .chars()
        .filter(|c| matches!(*c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF))
        .collect();
    for pair in cjk.windows(2) {
        out.insert(pair.iter().collect());
    }
    out
}
