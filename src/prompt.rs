//! Prompt assembly with prioritized sections and a hard token ceiling.
//!
//! Templates carry `{{name}}` placeholders. Each section is `required`,
//! `important` or `optional`; when the filled prompt exceeds the ceiling,
//! optional sections are dropped left to right, then important sections are
//! tail-truncated. Required sections are never touched: if they alone blow
//! the ceiling the full prompt is returned with `truncated = true` and the
//! caller decides whether to proceed or fail with `prompt_too_long`.

use crate::util::{estimate_tokens, truncate_to_tokens};

/// Priority of a prompt section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionPriority {
    Required,
    Important,
    Optional,
}

/// One named section to substitute into a `{{name}}` placeholder.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub content: String,
    pub priority: SectionPriority,
}

impl Section {
    pub fn required(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            priority: SectionPriority::Required,
        }
    }

    pub fn important(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            priority: SectionPriority::Important,
        }
    }

    pub fn optional(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            priority: SectionPriority::Optional,
        }
    }
}

/// Result of prompt assembly.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub token_count: usize,
    /// True when any section was dropped or truncated, or when the
    /// required sections alone exceed the ceiling.
    pub truncated: bool,
}

fn fill(template: &str, sections: &[Section]) -> String {
    let mut prompt = template.to_string();
    for section in sections {
        let placeholder = format!("{{{{{}}}}}", section.name);
        prompt = prompt.replace(&placeholder, &section.content);
    }
    prompt
}

/// Assemble `template` from `sections` under `token_ceiling`.
pub fn assemble_prompt(
    template: &str,
    sections: &[Section],
    token_ceiling: usize,
) -> AssembledPrompt {
    let full = fill(template, sections);
    let full_tokens = estimate_tokens(&full);
    if full_tokens <= token_ceiling {
        return AssembledPrompt {
            prompt: full,
            token_count: full_tokens,
            truncated: false,
        };
    }

    let mut working: Vec<Section> = sections.to_vec();

    // Drop optional sections left to right until the prompt fits.
    for i in 0..working.len() {
        if working[i].priority != SectionPriority::Optional || working[i].content.is_empty() {
            continue;
        }
        working[i].content.clear();
        let prompt = fill(template, &working);
        let tokens = estimate_tokens(&prompt);
        if tokens <= token_ceiling {
            return AssembledPrompt {
                prompt,
                token_count: tokens,
                truncated: true,
            };
        }
    }

    // Still over: tail-truncate important sections left to right.
    for i in 0..working.len() {
        if working[i].priority != SectionPriority::Important || working[i].content.is_empty() {
            continue;
        }
        let prompt = fill(template, &working);
        let overage = estimate_tokens(&prompt).saturating_sub(token_ceiling);
        let section_tokens = estimate_tokens(&working[i].content);
        let keep = section_tokens.saturating_sub(overage);
        working[i].content = truncate_to_tokens(&working[i].content, keep);
        let prompt = fill(template, &working);
        let tokens = estimate_tokens(&prompt);
        if tokens <= token_ceiling {
            return AssembledPrompt {
                prompt,
                token_count: tokens,
                truncated: true,
            };
        }
    }

    // Required sections alone exceed the ceiling. Hand back the verbatim
    // prompt; the caller owns the prompt_too_long decision.
    let prompt = fill(template, &working);
    let tokens = estimate_tokens(&prompt);
    AssembledPrompt {
        prompt,
        token_count: tokens,
        truncated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everything_fits_untouched() {
        let result = assemble_prompt(
            "A: {{a}}\nB: {{b}}",
            &[
                Section::required("a", "required text"),
                Section::optional("b", "optional text"),
            ],
            1000,
        );
        assert!(!result.truncated);
        assert!(result.prompt.contains("required text"));
        assert!(result.prompt.contains("optional text"));
        assert_eq!(result.token_count, estimate_tokens(&result.prompt));
    }

    #[test]
    fn test_optionals_dropped_left_to_right() {
        let big = "x".repeat(400); // 100 tokens each
        let result = assemble_prompt(
            "{{a}}|{{b}}|{{c}}",
            &[
                Section::required("a", big.clone()),
                Section::optional("b", big.clone()),
                Section::optional("c", big.clone()),
            ],
            210,
        );
        assert!(result.truncated);
        // Dropping b alone brings the total to ~200 tokens; c survives.
        assert!(!result.prompt.contains(&format!("{big}|{big}|")));
        assert!(result.prompt.ends_with(&format!("|{big}")));
        assert!(result.token_count <= 210);
    }

    #[test]
    fn test_important_sections_tail_truncated_after_optionals() {
        let big = "y".repeat(400);
        let result = assemble_prompt(
            "{{a}}|{{b}}|{{c}}",
            &[
                Section::required("a", big.clone()),
                Section::important("b", big.clone()),
                Section::optional("c", big.clone()),
            ],
            150,
        );
        assert!(result.truncated);
        assert!(result.token_count <= 150);
        // Required section is verbatim; important is a prefix of itself.
        assert!(result.prompt.starts_with(&big));
    }

    #[test]
    fn test_required_never_truncated_even_over_ceiling() {
        let big = "z".repeat(4000); // 1000 tokens
        let result = assemble_prompt("{{a}}", &[Section::required("a", big.clone())], 100);
        assert!(result.truncated);
        assert!(result.prompt.contains(&big), "required must stay verbatim");
        assert!(result.token_count > 100);
    }

    #[test]
    fn test_zero_sized_optional_is_skipped() {
        let result = assemble_prompt(
            "{{a}}{{b}}",
            &[
                Section::required("a", "q".repeat(4000)),
                Section::optional("b", ""),
            ],
            100,
        );
        // The empty optional cannot save anything; required stays whole.
        assert!(result.truncated);
    }

    #[test]
    fn test_unknown_placeholders_are_left_alone() {
        let result = assemble_prompt("{{a}} {{mystery}}", &[Section::required("a", "hi")], 100);
        assert!(result.prompt.contains("{{mystery}}"));
    }
}
