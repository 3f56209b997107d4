//! Deterministic keyword classification stage.
//!
//! A pure function of the request text: repeated calls yield identical
//! results. Each tier's score is a weighted sum of four signals (keyword
//! patterns, length, context indicators, explicit hint); the tier with the
//! highest score wins and the margin between the top two scores drives
//! confidence.

use std::collections::HashMap;

use super::{Classification, ClassificationSource, Tier};

const WEIGHT_PATTERN: f64 = 0.4;
const WEIGHT_LENGTH: f64 = 0.2;
const WEIGHT_CONTEXT: f64 = 0.3;
const WEIGHT_HINT: f64 = 0.1;

/// Bonus added per matched keyword for the two heaviest tiers, so that a
/// short "delegate to the team" is not dragged down to trivial by its length.
const HEAVY_TIER_KEYWORD_BONUS: f64 = 8.0;

const TRIVIAL_KEYWORDS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "yes", "no", "good morning",
    "good night", "bye", "lol", "nice", "cool", "great",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "what is",
    "what's",
    "who is",
    "when is",
    "where is",
    "define",
    "translate",
    "convert",
    "how much",
    "how many",
    "remind me",
    "weather",
    "meaning of",
    "spell",
];

const MODERATE_KEYWORDS: &[&str] = &[
    "summarize",
    "summarise",
    "explain",
    "compare",
    "draft",
    "rewrite",
    "rephrase",
    "outline",
    "brainstorm",
    "review this",
    "describe",
    "recommend",
    "suggest",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "implement",
    "refactor",
    "debug",
    "analyze",
    "analyse",
    "design",
    "architect",
    "migrate",
    "optimize",
    "optimise",
    "integrate",
    "build a",
    "write a script",
    "multi-step",
    "step by step",
    "delegate",
    "automate",
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "production",
    "incident",
    "outage",
    "security",
    "vulnerability",
    "urgent",
    "critical",
    "data loss",
    "deploy to",
    "rollback",
    "delegate to team",
    "escalate",
];

fn keywords_for(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Trivial => TRIVIAL_KEYWORDS,
        Tier::Simple => SIMPLE_KEYWORDS,
        Tier::Moderate => MODERATE_KEYWORDS,
        Tier::Complex => COMPLEX_KEYWORDS,
        Tier::Critical => CRITICAL_KEYWORDS,
    }
}

/// Keyword-pattern signal: fraction of the tier's keyword list present in
/// the lower-cased text, with a flat per-keyword bonus for the heavy tiers.
fn pattern_score(tier: Tier, text_lower: &str) -> f64 {
    let keywords = keywords_for(tier);
    let matched = keywords
        .iter()
        .filter(|kw| text_lower.contains(*kw))
        .count();
    let mut score = matched as f64 / keywords.len() as f64;
    if matches!(tier, Tier::Complex | Tier::Critical) {
        score += HEAVY_TIER_KEYWORD_BONUS * matched as f64;
    }
    score
}

/// Token-count bands per tier. Inside the band the signal is 1.0, outside it
/// falls off linearly over one band-width.
fn length_band(tier: Tier) -> (f64, f64) {
    match tier {
        Tier::Trivial => (0.0, 50.0),
        Tier::Simple => (50.0, 200.0),
        Tier::Moderate => (200.0, 500.0),
        Tier::Complex => (500.0, 1000.0),
        Tier::Critical => (1000.0, 4000.0),
    }
}

fn length_score(tier: Tier, tokens: usize) -> f64 {
    let (lo, hi) = length_band(tier);
    let t = tokens as f64;
    if t >= lo && t <= hi {
        return 1.0;
    }
    let width = (hi - lo).max(1.0);
    let distance = if t < lo { lo - t } else { t - hi };
    (1.0 - distance / width).max(0.0)
}

/// Context indicators: structural features of the text each nudge specific
/// tiers by a small amount.
fn context_score(tier: Tier, text: &str, text_lower: &str) -> f64 {
    let mut score: f64 = 0.0;

    let has_code_fence = text.contains("```");
    let has_url = text_lower.contains("http://") || text_lower.contains("https://");
    let json_like = text.contains("{\"") || (text.contains('{') && text.contains("\":"));
    let has_error_talk = ["error", "exception", "traceback", "stack trace", "panicked"]
        .iter()
        .any(|kw| text_lower.contains(kw));
    let multi_step = ["first,", "then ", "finally", "step 1", "\n1.", "\n2.", "\n- "]
        .iter()
        .any(|kw| text_lower.contains(kw));
    let has_question = text.contains('?');
    let command_verb = ["run ", "create ", "delete ", "install ", "fix ", "update "]
        .iter()
        .any(|kw| text_lower.starts_with(kw));

    if has_code_fence {
        match tier {
            Tier::Moderate => score += 0.3,
            Tier::Complex => score += 0.5,
            _ => {}
        }
    }
    if has_url {
        match tier {
            Tier::Simple => score += 0.2,
            Tier::Moderate => score += 0.4,
            _ => {}
        }
    }
    if json_like {
        match tier {
            Tier::Moderate => score += 0.3,
            Tier::Complex => score += 0.3,
            _ => {}
        }
    }
    if has_error_talk {
        match tier {
            Tier::Moderate => score += 0.3,
            Tier::Complex => score += 0.5,
            _ => {}
        }
    }
    if multi_step {
        match tier {
            Tier::Complex => score += 0.6,
            Tier::Critical => score += 0.2,
            _ => {}
        }
    }
    if has_question {
        match tier {
            Tier::Trivial => score += 0.2,
            Tier::Simple => score += 0.3,
            _ => {}
        }
    }
    if command_verb {
        match tier {
            Tier::Moderate => score += 0.3,
            Tier::Complex => score += 0.3,
            _ => {}
        }
    }

    score
}

fn tier_score(tier: Tier, text: &str, text_lower: &str, tokens: usize, forced: Option<Tier>) -> f64 {
    let hint = if forced == Some(tier) { 1.0 } else { 0.0 };
    WEIGHT_PATTERN * pattern_score(tier, text_lower)
        + WEIGHT_LENGTH * length_score(tier, tokens)
        + WEIGHT_CONTEXT * context_score(tier, text, text_lower)
        + WEIGHT_HINT * hint
}

/// Classify text by keyword scoring alone.
pub fn classify_keywords(text: &str, forced: Option<Tier>) -> Classification {
    let text_lower = text.to_lowercase();
    let tokens = text.split_whitespace().count();

    let mut scores = HashMap::new();
    let mut best = Tier::Trivial;
    let mut best_score = f64::MIN;
    let mut second_score = f64::MIN;

    for tier in Tier::ALL {
        let score = tier_score(tier, text, &text_lower, tokens, forced);
        scores.insert(tier, score);
        if score > best_score {
            second_score = best_score;
            best_score = score;
            best = tier;
        } else if score > second_score {
            second_score = score;
        }
    }

    let confidence = if best_score > 0.0 && second_score > f64::MIN {
        ((best_score - second_score) / best_score + 0.5).min(1.0)
    } else {
        0.5
    };

    Classification {
        tier: best,
        confidence,
        scores,
        source: ClassificationSource::Local,
        classifier_provider: None,
        reasoning: None,
    }
}
