//! Regex/keyword trigger matching over `TaskTemplate.triggerPatterns`/
//! `triggerKeywords` (§3), feeding candidates into the planner alongside
//! semantic retrieval.
//!
//! Grounded on `kernel::router::IntentRouter`'s two deterministic tiers
//! (an Aho-Corasick automaton for exact/keyword matches, then compiled
//! `regex::Regex` patterns), adapted from "route to the one winning
//! handler" to "collect every template whose triggers match" — Open
//! Question 1 (`DESIGN.md`) decided that trigger candidates augment the
//! planner's candidate list rather than short-circuiting to a single
//! winner, so there is no precedence order to preserve between the two
//! tiers the way `IntentRouter::route` has one.

use std::collections::HashSet;

use aho_corasick::AhoCorasick;
use regex::Regex;
use tracing::warn;

use adk_core::model::TaskTemplate;

struct CompiledPatterns {
    template_id: String,
    patterns: Vec<Regex>,
}

/// A snapshot index built from the current template set. Rebuilding is the
/// caller's responsibility (templates change rarely relative to requests);
/// `adk-runtime` rebuilds it once per `retrieve` call from whatever the
/// store currently holds.
pub struct TemplateTriggerIndex {
    keyword_automaton: Option<AhoCorasick>,
    keyword_owners: Vec<String>,
    patterns: Vec<CompiledPatterns>,
}

impl TemplateTriggerIndex {
    pub fn build(templates: &[TaskTemplate]) -> Self {
        let mut keywords = Vec::new();
        let mut keyword_owners = Vec::new();
        let mut patterns = Vec::new();

        for template in templates.iter().filter(|t| t.enabled) {
            for keyword in &template.trigger_keywords {
                keywords.push(keyword.to_lowercase());
                keyword_owners.push(template.template_id.clone());
            }

            let compiled: Vec<Regex> = template
                .trigger_patterns
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!(
                            template_id = %template.template_id,
                            pattern = %pattern,
                            error = %err,
                            "skipping invalid trigger pattern"
                        );
                        None
                    }
                })
                .collect();

            if !compiled.is_empty() {
                patterns.push(CompiledPatterns {
                    template_id: template.template_id.clone(),
                    patterns: compiled,
                });
            }
        }

        let keyword_automaton = if keywords.is_empty() {
            None
        } else {
            AhoCorasick::new(&keywords).ok()
        };

        Self { keyword_automaton, keyword_owners, patterns }
    }

    /// Every `templateId` whose keyword list or pattern list matches
    /// `message`, deduplicated, keyword hits first in automaton order then
    /// pattern hits in registration order.
    pub fn match_candidates(&self, message: &str) -> Vec<String> {
        let lowered = message.to_lowercase();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        if let Some(automaton) = &self.keyword_automaton {
            for m in automaton.find_iter(&lowered) {
                let owner = &self.keyword_owners[m.pattern().as_usize()];
                if seen.insert(owner.clone()) {
                    out.push(owner.clone());
                }
            }
        }

        for entry in &self.patterns {
            if seen.contains(&entry.template_id) {
                continue;
            }
            if entry.patterns.iter().any(|re| re.is_match(&lowered)) {
                seen.insert(entry.template_id.clone());
                out.push(entry.template_id.clone());
            }
        }

        out
    }
}
