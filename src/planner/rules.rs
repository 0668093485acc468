//! Rule-based responses
//!
//! Rules are an ordered list of keyword patterns and canned replies. The
//! user's text is normalized, and the first rule with a pattern that appears
//! in it as whole words wins.

use std::path::Path;
use std::sync::LazyLock;

use chrono::Local;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::Deserialize;

use super::EMPTY_QUERY_REPLY;
use crate::error::PlanError;
use crate::{Error, Result};

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));

/// Rule name whose responses are used when nothing matches
pub const FALLBACK_RULE: &str = "fallback";

/// One entry of the rules resource
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    pub responses: Vec<String>,
}

/// First-match rule planner
#[derive(Debug, Clone)]
pub struct RulesPlanner {
    rules: Vec<Rule>,
    fallback: Vec<String>,
}

impl RulesPlanner {
    /// Build from an ordered rule list
    ///
    /// A rule named `fallback` with no patterns supplies the fallback
    /// responses; otherwise `fallback_reply` is used when non-empty.
    #[must_use]
    pub fn new(rules: Vec<Rule>, fallback_reply: &str) -> Self {
        let mut fallback = Vec::new();
        let mut ordered = Vec::with_capacity(rules.len());
        for mut rule in rules {
            if rule.name == FALLBACK_RULE && rule.patterns.is_empty() {
                fallback.extend(rule.responses);
                continue;
            }
            rule.patterns = rule
                .patterns
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect();
            ordered.push(rule);
        }
        if fallback.is_empty() && !fallback_reply.trim().is_empty() {
            fallback.push(fallback_reply.to_string());
        }
        Self {
            rules: ordered,
            fallback,
        }
    }

    /// Load rules from a YAML or JSON file, else the built-in set
    #[must_use]
    pub fn load(path: Option<&Path>, fallback_reply: &str) -> Self {
        let rules = match path {
            Some(path) => match read_rules(path) {
                Ok(rules) => {
                    tracing::info!(path = %path.display(), rules = rules.len(), "loaded response rules");
                    rules
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to load response rules, using built-in set"
                    );
                    default_rules()
                }
            },
            None => default_rules(),
        };
        Self::new(rules, fallback_reply)
    }

    /// Pick a reply for `text`
    ///
    /// # Errors
    ///
    /// Returns `PlanError::NoMatch` only if nothing matches and there is no
    /// fallback reply at all
    pub fn plan(&self, text: &str) -> std::result::Result<String, PlanError> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Ok(EMPTY_QUERY_REPLY.to_string());
        }

        let padded = format!(" {normalized} ");
        let matched = self.rules.iter().find(|rule| {
            rule.patterns
                .iter()
                .any(|p| padded.contains(&format!(" {p} ")))
        });

        let responses = match matched {
            Some(rule) => {
                tracing::debug!(rule = %rule.name, "response rule matched");
                &rule.responses
            }
            None => {
                tracing::debug!("no response rule matched, using fallback");
                &self.fallback
            }
        };

        let choice = responses
            .choose(&mut rand::thread_rng())
            .ok_or(PlanError::NoMatch)?;
        Ok(render(choice))
    }

    /// Rules in match order, fallback excluded
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Lower-case, drop punctuation, and collapse whitespace
#[must_use]
pub fn normalize(text: &str) -> String {
    PUNCTUATION
        // Apostrophes join words ("what's" -> "whats"), other marks split
        .replace_all(&text.to_lowercase(), |caps: &regex::Captures<'_>| {
            if matches!(&caps[0], "'" | "\u{2019}") { "" } else { " " }
        })
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand `function:` responses
fn render(response: &str) -> String {
    match response.strip_prefix("function:") {
        Some("get_time") => format!("It's {}.", Local::now().format("%I:%M %p")),
        Some("get_date") => format!("Today is {}.", Local::now().format("%A, %B %d, %Y")),
        Some(other) => {
            tracing::warn!(function = other, "unknown response function");
            response.to_string()
        }
        None => response.to_string(),
    }
}

fn read_rules(path: &Path) -> Result<Vec<Rule>> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let rules: Vec<Rule> = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    if rules.is_empty() {
        return Err(Error::Planner("rules resource is empty".to_string()));
    }
    Ok(rules)
}

/// Built-in rules used when no resource is configured
#[must_use]
pub fn default_rules() -> Vec<Rule> {
    let rule = |name: &str, patterns: &[&str], responses: &[&str]| Rule {
        name: name.to_string(),
        patterns: patterns.iter().map(ToString::to_string).collect(),
        responses: responses.iter().map(ToString::to_string).collect(),
    };
    vec![
        rule(
            "greeting",
            &["hello", "hi", "hey", "good morning", "good afternoon", "good evening"],
            &["Hello! How can I help you today?", "Hi there! What can I do for you?"],
        ),
        rule(
            "farewell",
            &["goodbye", "bye", "see you", "good night"],
            &["Goodbye! Have a great day.", "See you later!"],
        ),
        rule(
            "gratitude",
            &["thank you", "thanks", "appreciate it"],
            &["You're welcome!", "Happy to help."],
        ),
        rule(
            "time",
            &["what time", "the time", "current time"],
            &["function:get_time"],
        ),
        rule(
            "date",
            &["what day", "the date", "todays date", "what date"],
            &["function:get_date"],
        ),
        rule(
            "weather",
            &["weather", "temperature outside", "forecast"],
            &["I run completely offline, so I can't check the weather."],
        ),
        rule(
            "capabilities",
            &["what can you do", "help me", "your abilities"],
            &["I can answer simple questions, tell you the time and date, and chat a little, all offline."],
        ),
        rule(
            "identity",
            &["who are you", "your name", "what are you"],
            &["I'm Dia, an offline voice assistant."],
        ),
        rule(
            FALLBACK_RULE,
            &[],
            &[
                "I'm not sure how to respond to that.",
                "Sorry, I don't know about that yet.",
            ],
        ),
    ]
}
