//! Phrase-family intent analyzer.
//!
//! Each target agent has a handful of phrase families (purchase intent,
//! financing, valuation, ...). Every family that matches at least one user
//! message adds 0.25 to that agent's confidence, capped at 1.0. Agent
//! messages are ignored so the agents' own questions never count as intent.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use super::{validate_history, AnalysisError, IntentAnalyzer, IntentProfile};
use crate::types::{AgentType, Message, Role};

/// Confidence contributed by one matched phrase family.
pub const FAMILY_WEIGHT: f64 = 0.25;

struct PhraseFamily {
    agent: Option<AgentType>,
    name: &'static str,
    pattern: Regex,
}

fn family(agent: Option<AgentType>, name: &'static str, pattern: &str) -> PhraseFamily {
    PhraseFamily {
        agent,
        name,
        pattern: Regex::new(pattern).expect("phrase family regex should compile"),
    }
}

/// Families with `agent: None` are urgency markers feeding readiness only.
static FAMILIES: LazyLock<Vec<PhraseFamily>> = LazyLock::new(|| {
    use AgentType::{Buyer, Lead, Seller};
    vec![
        family(
            Some(Buyer),
            "purchase_intent",
            r"(?i)\b(want|looking|ready|planning|hoping|need)\s+to\s+(buy|purchase)\b|\bbuy(ing)?\s+(a|my|our)\s+(first\s+)?(home|house|place|condo)\b",
        ),
        family(
            Some(Buyer),
            "financing",
            r"(?i)\bpre-?approv(ed|al)\b|\bdown\s+payment\b|\bmortgage\s+rate",
        ),
        family(
            Some(Buyer),
            "budget",
            r"(?i)\bbudget\b|\$\s?\d{2,3}(,\d{3}|k)\b|\bprice\s+range\b",
        ),
        family(
            Some(Buyer),
            "home_criteria",
            r"(?i)\b\d\s?(br|bd|bed(room)?s?)\b|\bsquare\s+feet\b|\bsq\s?ft\b|\bbackyard\b",
        ),
        family(
            Some(Seller),
            "sale_intent",
            r"(?i)\bsell(ing)?\s+(my|our|the)\s+(house|home|property|condo|place)\b|\bwant\s+to\s+sell\b",
        ),
        family(
            Some(Seller),
            "valuation",
            r"(?i)\b(home|house|property|place)\s+(is\s+)?worth\b|\bhome\s+value\b|\bappraisal\b|\bvaluation\b",
        ),
        family(
            Some(Seller),
            "listing",
            r"(?i)\blist(ing)?\s+(my|our|the)\s+(house|home|property|condo|place)\b|\bput\s+it\s+on\s+the\s+market\b",
        ),
        family(
            Some(Seller),
            "cash_offer",
            r"(?i)\bcash\s+offer\b|\bsell\s+(it\s+)?as[\s-]is\b",
        ),
        family(
            Some(Lead),
            "browsing",
            r"(?i)\bjust\s+(browsing|looking|curious)\b|\bexploring\s+(my\s+)?options\b",
        ),
        family(
            Some(Lead),
            "not_ready",
            r"(?i)\bnot\s+ready\b|\bnot\s+(right\s+)?now\b|\bno\s+rush\b",
        ),
        family(
            Some(Lead),
            "long_horizon",
            r"(?i)\b(next|in\s+a)\s+year\b|\bsomeday\b|\bmaybe\s+later\b",
        ),
        family(
            None,
            "urgent",
            r"(?i)\basap\b|\bimmediately\b|\bright\s+away\b|\burgent(ly)?\b",
        ),
        family(
            None,
            "near_term",
            r"(?i)\bthis\s+(week|month)\b|\bnext\s+month\b|\bwithin\s+\d+\s+(days|weeks)\b",
        ),
    ]
});

/// Built-in deterministic analyzer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternAnalyzer;

impl PatternAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl IntentAnalyzer for PatternAnalyzer {
    fn analyze(&self, history: &[Message]) -> Result<IntentProfile, AnalysisError> {
        validate_history(history)?;
        let user_messages: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        if user_messages.is_empty() {
            return Ok(IntentProfile::floor());
        }

        let mut matched: BTreeSet<usize> = BTreeSet::new();
        for text in &user_messages {
            for (idx, family) in FAMILIES.iter().enumerate() {
                if family.pattern.is_match(text) {
                    matched.insert(idx);
                }
            }
        }

        let mut target_confidence: BTreeMap<AgentType, f64> =
            AgentType::all().iter().map(|a| (*a, 0.0)).collect();
        let mut detected_signals = Vec::with_capacity(matched.len());
        let mut urgency_hits = 0usize;
        for idx in &matched {
            let family = &FAMILIES[*idx];
            match family.agent {
                Some(agent) => {
                    let entry = target_confidence.entry(agent).or_insert(0.0);
                    *entry = (*entry + FAMILY_WEIGHT).min(1.0);
                    detected_signals.push(format!("{agent}.{}", family.name));
                }
                None => {
                    urgency_hits += 1;
                    detected_signals.push(format!("urgency.{}", family.name));
                }
            }
        }

        let best_confidence = target_confidence
            .iter()
            .filter(|(agent, _)| **agent != AgentType::Lead)
            .map(|(_, c)| *c)
            .fold(0.0_f64, f64::max);
        let readiness = (urgency_hits as f64 * 25.0 + best_confidence * 50.0).min(100.0);

        Ok(IntentProfile {
            readiness_score: readiness,
            commitment_score: commitment(&user_messages),
            target_confidence,
            detected_signals,
        })
    }
}

/// Engagement from volume, message length and questions asked.
fn commitment(user_messages: &[&str]) -> f64 {
    let count = user_messages.len() as f64;
    let avg_chars = user_messages.iter().map(|m| m.chars().count()).sum::<usize>() as f64 / count;
    let questions = user_messages.iter().filter(|m| m.contains('?')).count() as f64;
    let score = (count * 10.0).min(40.0) + (avg_chars / 4.0).min(30.0) + (questions * 10.0).min(30.0);
    score.clamp(0.0, 100.0)
}
