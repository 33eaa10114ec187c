//! Abuse and off-topic gate.
//!
//! A dialog is off-topic only when it is abusive (profanity count at or
//! above the threshold) and mentions none of the service keywords. Angry
//! complaints about a real order, refund or account always pass.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::FilterConfig;

const BUILTIN_PROFANITY: &[&str] = &[
    r"씨\s*발",
    r"시\s*발",
    r"ㅅ\s*ㅂ",
    r"ㅆ\s*ㅂ",
    r"병\s*신",
    r"ㅂ\s*ㅅ",
    r"개\s*새\s*끼",
    r"개\s*색\s*기",
    r"좆",
    r"존\s*나",
    r"ㅈ\s*ㄴ",
    r"미친\s*놈",
    r"(?i)\bf+u+c+k+",
    r"(?i)\bshit",
    r"(?i)\bbitch",
];

static BUILTIN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    BUILTIN_PROFANITY
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
});

/// Profanity counter plus service-keyword allowlist.
pub struct TopicFilter {
    patterns: Vec<Regex>,
    threshold: usize,
    service_keywords: Vec<String>,
}

impl TopicFilter {
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let patterns = match &config.profanity_patterns {
            Some(custom) => custom
                .iter()
                .map(|p| {
                    Regex::new(p).with_context(|| format!("Invalid profanity pattern: {}", p))
                })
                .collect::<Result<Vec<_>>>()?,
            None => BUILTIN_PATTERNS.clone(),
        };

        Ok(Self {
            patterns,
            threshold: config.profanity_threshold,
            service_keywords: config.service_keywords.clone(),
        })
    }

    /// Total profanity matches across all patterns.
    pub fn profanity_count(&self, text: &str) -> usize {
        self.patterns.iter().map(|re| re.find_iter(text).count()).sum()
    }

    pub fn is_off_topic(&self, dialog: &str) -> bool {
        is_off_topic_with(
            self.profanity_count(dialog),
            dialog,
            self.threshold,
            &self.service_keywords,
        )
    }
}

/// Off-topic check using the built-in profanity list.
pub fn is_off_topic(dialog: &str, profanity_threshold: usize, service_keywords: &[String]) -> bool {
    let count: usize = BUILTIN_PATTERNS
        .iter()
        .map(|re| re.find_iter(dialog).count())
        .sum();
    is_off_topic_with(count, dialog, profanity_threshold, service_keywords)
}

fn is_off_topic_with(
    profanity: usize,
    dialog: &str,
    threshold: usize,
    service_keywords: &[String],
) -> bool {
    if profanity < threshold {
        return false;
    }
    !service_keywords
        .iter()
        .any(|kw| !kw.is_empty() && dialog.contains(kw.as_str()))
}
