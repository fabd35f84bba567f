//! Solution-attempt classification for assistant entries.
//!
//! The decision is semantic, not keyword-count-only: strong indicators
//! (code fences, tool-invocation verbs, install/run commands) short-circuit
//! to `true`; otherwise matches across pattern categories feed a decision
//! table that also weighs code context, numbered steps, and length.

use regex::Regex;

use crate::schema::SolutionCategory;

use super::text::has_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternCategory {
    Help,
    Implementation,
    Modification,
    Instruction,
    Resolution,
    Guidance,
}

pub struct SolutionClassifier {
    strong: Vec<Regex>,
    categories: Vec<(PatternCategory, Regex)>,
    numbered_steps: Regex,
}

impl SolutionClassifier {
    pub fn new() -> Self {
        let strong = [
            r"```",
            r"(?i)\brun (this|the following)\b",
            r"(?i)\b(npm|pip|cargo|apt|brew) install\b",
            r"(?i)\blet me (edit|write|create|update|run)\b",
            r"(?i)\bi('|a)?ll (edit|write|create|update|run)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        let categories = [
            (PatternCategory::Help, r"(?i)\b(you can|you could|try|one way is)\b"),
            (
                PatternCategory::Implementation,
                r"(?i)\b(i('ve| have)? (implemented|added|created|written)|here('s| is) the (implementation|code))\b",
            ),
            (
                PatternCategory::Modification,
                r"(?i)\b(i('ve| have)? (updated|changed|modified|edited|renamed|refactored|removed))\b",
            ),
            (
                PatternCategory::Instruction,
                r"(?i)(\bfirst,|\bthen\b|\bnext,|\bstep \d|\bfollow these\b)",
            ),
            (
                PatternCategory::Resolution,
                r"(?i)\b(this (fixes|resolves|solves)|the fix\b|fixed the\b|should (fix|resolve|work)|the (issue|problem) was)\b",
            ),
            (
                PatternCategory::Guidance,
                r"(?i)\b(i('d)? recommend|i suggest|you should|best practice|consider using)\b",
            ),
        ]
        .iter()
        .map(|(cat, p)| (*cat, Regex::new(p).expect("static pattern")))
        .collect();

        Self {
            strong,
            categories,
            numbered_steps: Regex::new(r"(?m)^\s*\d+[.)]\s").expect("static pattern"),
        }
    }

    pub fn matched_categories(&self, text: &str) -> Vec<PatternCategory> {
        self.categories
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(cat, _)| *cat)
            .collect()
    }

    /// Decision table:
    /// - strong indicator → true
    /// - ≥ 2 pattern categories → true
    /// - 1 category + (code context OR numbered steps) → true
    /// - 1 category + length > 100 → true
    /// - code context + length > 50 → true
    /// - else false
    pub fn is_solution_attempt(&self, text: &str) -> bool {
        if self.strong.iter().any(|re| re.is_match(text)) {
            return true;
        }

        let categories = self.matched_categories(text).len();
        let code = has_code(text);
        let steps = self.numbered_steps.is_match(text);
        let length = text.len();

        match categories {
            n if n >= 2 => true,
            1 if code || steps => true,
            1 if length > 100 => true,
            _ => code && length > 50,
        }
    }

    /// Assign a category from verbs and surface cues.  Only meaningful when
    /// `is_solution_attempt` returned true.
    pub fn categorize(&self, text: &str) -> SolutionCategory {
        let lower = text.to_lowercase();

        let command_cues = ["install", "run ", "$ ", "cargo ", "npm ", "pip ", "docker ", "kubectl "];
        let config_cues = [
            ".toml", ".yaml", ".yml", ".json", ".env", "config", "environment variable", "settings",
        ];
        let edit_verbs = [
            "i've updated", "i updated", "i've edited", "i edited", "i've added", "i added",
            "i've created", "i created", "i've changed", "i changed", "i've refactored",
        ];
        let explain_cues = ["because", "the reason", "this works by", "under the hood", "what's happening"];

        let fenced = text.contains("```");
        if fenced && command_cues.iter().any(|c| lower.contains(c)) && !edit_verbs.iter().any(|c| lower.contains(c)) {
            return SolutionCategory::Command;
        }
        if fenced || edit_verbs.iter().any(|c| lower.contains(c)) {
            if config_cues.iter().any(|c| lower.contains(c)) && !fenced {
                return SolutionCategory::Config;
            }
            return SolutionCategory::CodeEdit;
        }
        if command_cues.iter().any(|c| lower.contains(c)) {
            return SolutionCategory::Command;
        }
        if config_cues.iter().any(|c| lower.contains(c)) {
            return SolutionCategory::Config;
        }
        if explain_cues.iter().any(|c| lower.contains(c)) {
            return SolutionCategory::Explanation;
        }
        SolutionCategory::Guidance
    }
}

impl Default for SolutionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> SolutionClassifier {
        SolutionClassifier::new()
    }

    #[test]
    fn code_fence_short_circuits_to_solution() {
        assert!(classifier().is_solution_attempt("```rust\nfn main() {}\n```"));
    }

    #[test]
    fn install_command_short_circuits_to_solution() {
        assert!(classifier().is_solution_attempt("cargo install ripgrep"));
    }

    #[test]
    fn two_categories_make_a_solution() {
        // Help + Resolution, no code, short.
        let text = "You can restart the daemon, this fixes the stale socket.";
        assert!(classifier().is_solution_attempt(text));
    }

    #[test]
    fn one_category_with_numbered_steps_is_a_solution() {
        let text = "Follow these:\n1. stop the service\n2. clear the cache";
        assert!(classifier().is_solution_attempt(text));
    }

    #[test]
    fn one_short_category_without_context_is_not_a_solution() {
        assert!(!classifier().is_solution_attempt("You could ask upstream."));
    }

    #[test]
    fn plain_chat_is_not_a_solution() {
        assert!(!classifier().is_solution_attempt("Interesting question!"));
        assert!(!classifier().is_solution_attempt("What error do you see?"));
    }

    #[test]
    fn long_single_category_answer_is_a_solution() {
        let text = "I recommend pinning the dependency to the previous minor version until \
                    upstream publishes a fix, since the regression only affects the resolver.";
        assert!(text.len() > 100);
        assert!(classifier().is_solution_attempt(text));
    }

    #[test]
    fn categorize_distinguishes_command_and_code_edit() {
        let c = classifier();
        assert_eq!(
            c.categorize("run this:\n```\nnpm install left-pad\n```"),
            crate::schema::SolutionCategory::Command
        );
        assert_eq!(
            c.categorize("I've updated the handler:\n```rust\nfn handle() {}\n```"),
            crate::schema::SolutionCategory::CodeEdit
        );
        assert_eq!(
            c.categorize("Set the RUST_LOG environment variable in your settings"),
            crate::schema::SolutionCategory::Config
        );
        assert_eq!(
            c.categorize("This happens because the borrow checker sees two mutable paths"),
            crate::schema::SolutionCategory::Explanation
        );
        assert_eq!(
            c.categorize("I recommend the smaller of the two approaches"),
            crate::schema::SolutionCategory::Guidance
        );
    }
}
