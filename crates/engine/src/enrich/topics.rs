//! Topic-detection stage: score text against a fixed topic lexicon.

use std::collections::BTreeMap;

/// Built-in topic lexicon.  Configuration may merge extra topics over this.
pub fn builtin_lexicon() -> BTreeMap<String, Vec<String>> {
    let raw: &[(&str, &[&str])] = &[
        (
            "debugging",
            &["debug", "error", "stack trace", "traceback", "breakpoint", "crash", "segfault", "panic", "exception", "bug"],
        ),
        (
            "performance",
            &["slow", "performance", "latency", "optimize", "profiling", "benchmark", "throughput", "memory leak", "cpu"],
        ),
        (
            "authentication",
            &["auth", "login", "token", "oauth", "session", "password", "jwt", "credentials", "permission"],
        ),
        (
            "deployment",
            &["deploy", "release", "docker", "kubernetes", "ci", "pipeline", "rollout", "production", "staging", "nginx"],
        ),
        (
            "testing",
            &["test", "unit test", "integration test", "assert", "mock", "fixture", "coverage", "flaky"],
        ),
        (
            "styling",
            &["css", "style", "layout", "theme", "font", "responsive", "tailwind", "color scheme"],
        ),
        (
            "database",
            &["database", "sql", "query", "migration", "schema", "index", "postgres", "sqlite", "transaction"],
        ),
        (
            "api",
            &["api", "endpoint", "rest", "request", "response", "http", "webhook", "grpc", "payload"],
        ),
        (
            "state_management",
            &["state", "store", "redux", "reducer", "signal", "reactive", "context provider"],
        ),
        (
            "configuration",
            &["config", "configuration", "environment variable", "settings", "toml", "yaml", "dotenv", "flag"],
        ),
        (
            "security",
            &["security", "vulnerability", "xss", "injection", "sanitize", "cve", "encryption"],
        ),
        (
            "build_tooling",
            &["build", "compile", "cargo", "webpack", "bundler", "linker", "makefile", "dependency"],
        ),
    ];

    raw.iter()
        .map(|(topic, keywords)| {
            (
                topic.to_string(),
                keywords.iter().map(|k| k.to_string()).collect(),
            )
        })
        .collect()
}

/// Score `text` against the lexicon.  Confidence grows with the number of
/// distinct keywords matched and saturates at 1.0; topics scoring below
/// `threshold` are dropped.
pub fn score_topics(
    text: &str,
    lexicon: &BTreeMap<String, Vec<String>>,
    threshold: f32,
) -> BTreeMap<String, f32> {
    let lower = text.to_lowercase();
    let mut scores = BTreeMap::new();

    for (topic, keywords) in lexicon {
        let mut distinct = 0usize;
        let mut occurrences = 0usize;
        for keyword in keywords {
            let hits = count_occurrences(&lower, keyword);
            if hits > 0 {
                distinct += 1;
                occurrences += hits;
            }
        }
        if distinct == 0 {
            continue;
        }

        let extra = occurrences.saturating_sub(distinct).min(5);
        let confidence = (0.25 * distinct as f32 + 0.05 * extra as f32).min(1.0);
        if confidence >= threshold {
            scores.insert(topic.clone(), confidence);
        }
    }

    scores
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut start = 0;
    while let Some(offset) = haystack[start..].find(needle) {
        let begin = start + offset;
        let end = begin + needle.len();
        // Word-boundary check on both sides keeps "ci" out of "circle".
        let before_ok = begin == 0
            || !haystack[..begin]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        let after_ok = end == haystack.len()
            || !haystack[end..].chars().next().is_some_and(char::is_alphanumeric);
        if before_ok && after_ok {
            count += 1;
        }
        start = end;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_relevant_topics() {
        let lexicon = builtin_lexicon();
        let scores = score_topics(
            "the deploy pipeline fails in docker with a stack trace",
            &lexicon,
            0.15,
        );
        assert!(scores.contains_key("deployment"));
        assert!(scores.contains_key("debugging"));
        assert!(!scores.contains_key("styling"));
    }

    #[test]
    fn more_distinct_keywords_raise_confidence() {
        let lexicon = builtin_lexicon();
        let one = score_topics("we have a bug", &lexicon, 0.0);
        let three = score_topics("we have a bug, see the stack trace from the crash", &lexicon, 0.0);
        assert!(three["debugging"] > one["debugging"]);
    }

    #[test]
    fn confidence_is_capped_at_one() {
        let lexicon = builtin_lexicon();
        let text = "debug error stack trace traceback breakpoint crash segfault panic exception bug bug bug";
        let scores = score_topics(text, &lexicon, 0.0);
        assert!(scores["debugging"] <= 1.0);
    }

    #[test]
    fn word_boundaries_prevent_substring_hits() {
        let lexicon = builtin_lexicon();
        // "ci" must not match inside "circle", "api" not inside "rapid".
        let scores = score_topics("the circle moved rapidly", &lexicon, 0.0);
        assert!(!scores.contains_key("deployment"));
        assert!(!scores.contains_key("api"));
    }

    #[test]
    fn threshold_filters_weak_topics() {
        let lexicon = builtin_lexicon();
        let scores = score_topics("we have a bug", &lexicon, 0.5);
        assert!(scores.is_empty());
    }
}
