//! Text-feature stage: code detection and tool-name extraction.

/// Language keywords from the curated list.  Matched anywhere in the text;
/// the trailing space on most entries keeps prose words like "classic" from
/// firing the `class ` keyword.
const LANGUAGE_KEYWORDS: &[&str] = &[
    "fn ", "def ", "class ", "impl ", "struct ", "enum ", "trait ",
    "function ", "const ", "import ", "from ", "#include", "async fn",
    "public static", "lambda ", "=> {",
];

/// Command-prefix tokens that mark shell content at the start of a line.
const COMMAND_PREFIXES: &[&str] = &[
    "$ ", "> ", "cargo ", "npm ", "npx ", "pip ", "python ", "git ",
    "docker ", "kubectl ", "sudo ", "make ", "curl ", "apt ", "brew ",
];

pub fn has_code(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    if LANGUAGE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return true;
    }
    text.lines()
        .map(str::trim_start)
        .any(|line| COMMAND_PREFIXES.iter().any(|prefix| line.starts_with(prefix)))
}

/// Extract configured tool names referenced by the message.  Matching is
/// exact-case on word boundaries — tool names are proper identifiers and a
/// lowercase "read" in prose is not a `Read` invocation.
pub fn tools_used(text: &str, tool_names: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for name in tool_names {
        if name.is_empty() {
            continue;
        }
        let mut start = 0;
        while let Some(offset) = text[start..].find(name.as_str()) {
            let begin = start + offset;
            let end = begin + name.len();
            let before_ok = begin == 0
                || !text[..begin]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_');
            let after_ok = end == text.len()
                || !text[end..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_');
            if before_ok && after_ok {
                found.push(name.clone());
                break;
            }
            start = end;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_blocks_count_as_code() {
        assert!(has_code("here you go:\n```rust\nfn main() {}\n```"));
    }

    #[test]
    fn language_keywords_count_as_code() {
        assert!(has_code("add impl Display for Config to the module"));
        assert!(!has_code("the implication is unclear"));
    }

    #[test]
    fn command_prefixes_count_as_code() {
        assert!(has_code("run this:\n  cargo test --workspace"));
        assert!(!has_code("the cargo was shipped overseas"));
    }

    #[test]
    fn plain_prose_is_not_code() {
        assert!(!has_code("what does this error message mean?"));
    }

    #[test]
    fn tool_names_match_on_word_boundaries() {
        let tools: Vec<String> = ["Read", "Bash", "Grep"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let found = tools_used("I used the Read tool then ran Bash", &tools);
        assert_eq!(found, vec!["Read", "Bash"]);

        // Embedded occurrences don't count.
        assert!(tools_used("ReadMe describes the setup", &tools).is_empty());
        // Lowercase prose doesn't count.
        assert!(tools_used("please read the manual", &tools).is_empty());
    }
}
