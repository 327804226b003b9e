//! Methodology pack: prompt template retrieval.
//!
//! Templates resolve from `<pack-root>/prompts/<name>.md` when the file
//! exists, falling back to the built-in defaults below. `init` writes the
//! defaults out so operators can edit them in place.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub const TEMPLATE_ANALYSIS: &str = "analysis";
pub const TEMPLATE_PLANNING: &str = "planning";
pub const TEMPLATE_ARCHITECTURE: &str = "architecture";
pub const TEMPLATE_STORIES: &str = "stories";
pub const TEMPLATE_CREATE_STORY: &str = "create-story";
pub const TEMPLATE_DEV_STORY: &str = "dev-story";
pub const TEMPLATE_CODE_REVIEW: &str = "code-review";
pub const TEMPLATE_MINOR_FIXES: &str = "minor-fixes";
pub const TEMPLATE_MAJOR_REWORK: &str = "major-rework";

/// Template retrieval seam.
pub trait PromptPack: Send + Sync {
    fn template(&self, name: &str) -> Result<String>;
}

/// File-backed pack with built-in fallbacks.
pub struct FilePack {
    root: PathBuf,
}

impl FilePack {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    /// Write every default template under `prompts/`. Existing files are
    /// kept unless `force` is set.
    pub fn scaffold(&self, force: bool) -> Result<()> {
        let dir = self.prompts_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for (name, content) in BUILTIN_TEMPLATES {
            let path = dir.join(format!("{name}.md"));
            if path.exists() && !force {
                continue;
            }
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

impl PromptPack for FilePack {
    fn template(&self, name: &str) -> Result<String> {
        let path = self.prompts_dir().join(format!("{name}.md"));
        if path.exists() {
            return std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read template {}", path.display()));
        }
        builtin_template(name)
            .map(String::from)
            .with_context(|| format!("Unknown prompt template '{name}'"))
    }
}

fn builtin_template(name: &str) -> Option<&'static str> {
    BUILTIN_TEMPLATES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, content)| *content)
}

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (TEMPLATE_ANALYSIS, ANALYSIS_TEMPLATE),
    (TEMPLATE_PLANNING, PLANNING_TEMPLATE),
    (TEMPLATE_ARCHITECTURE, ARCHITECTURE_TEMPLATE),
    (TEMPLATE_STORIES, STORIES_TEMPLATE),
    (TEMPLATE_CREATE_STORY, CREATE_STORY_TEMPLATE),
    (TEMPLATE_DEV_STORY, DEV_STORY_TEMPLATE),
    (TEMPLATE_CODE_REVIEW, CODE_REVIEW_TEMPLATE),
    (TEMPLATE_MINOR_FIXES, MINOR_FIXES_TEMPLATE),
    (TEMPLATE_MAJOR_REWORK, MAJOR_REWORK_TEMPLATE),
];

const ANALYSIS_TEMPLATE: &str = r#"You are a product analyst. Study the concept below and produce a product brief.

## CONCEPT
{{concept}}

## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
problem_statement: <one paragraph>
target_users: <who this serves>
core_features:
  - <feature>
success_metrics:
  - <measurable outcome>
constraints:
  - <constraint>
```
"#;

const PLANNING_TEMPLATE: &str = r#"You are a product planner. Turn the product brief into a concrete plan.

## PRODUCT BRIEF
{{product_brief}}

## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
functional_requirements:
  - description: <what the system must do>
    priority: must|should|could
non_functional_requirements:
  - description: <quality attribute>
user_stories:
  - <as a ..., I want ..., so that ...>
tech_stack:
  language: <choice>
  storage: <choice>
domain_model:
  entities:
    - <entity>
out_of_scope:
  - <explicitly excluded>
```
"#;

const ARCHITECTURE_TEMPLATE: &str = r#"You are a software architect. Decide the architecture for these requirements.

## REQUIREMENTS
{{requirements}}

## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
architecture_decisions:
  - key: <kebab-case-topic>
    decision: <what was decided>
    rationale: <why>
```
"#;

const STORIES_TEMPLATE: &str = r#"You are a delivery planner. Break the plan into epics and stories.

## REQUIREMENTS
{{requirements}}

## ARCHITECTURE DECISIONS
{{architecture_decisions}}
{{gap_analysis}}
## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
epics:
  - id: 1
    title: <epic title>
stories:
  - key: 1-1
    epic: 1
    title: <story title>
    description: <what to build>
    acceptance_criteria:
      - <AC>
```
"#;

const CREATE_STORY_TEMPLATE: &str = r#"You are a story author. Write the full story markdown file for the story below, including a Tasks section with `- [ ] Tn: title` entries and AC references.

## EPIC CONTEXT
{{epic_context}}

## STORY
{{story_key}}

## OUTPUT
Write the story file to disk, then reply with exactly one fenced YAML block:

```yaml
result: success
story_file: <path you wrote>
story_key: {{story_key}}
story_title: <title>
```
"#;

const DEV_STORY_TEMPLATE: &str = r#"You are a developer. Implement the story below, honoring its acceptance criteria and running the tests.
{{task_scope}}{{prior_files}}
## STORY
{{story_content}}

## TEST PATTERNS
{{test_patterns}}

## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
result: success|failed
ac_met:
  - AC1
ac_failures: []
files_modified:
  - <path>
tests: pass|fail
notes: <optional>
```
"#;

const CODE_REVIEW_TEMPLATE: &str = r#"You are a code reviewer. Review the change below against the story.

## STORY
{{story_content}}

## DIFF
{{git_diff}}

## ARCHITECTURE CONSTRAINTS
{{arch_constraints}}
{{previous_findings}}
## OUTPUT
Reply with exactly one fenced YAML block:

```yaml
verdict: SHIP_IT|NEEDS_MINOR_FIXES|NEEDS_MAJOR_REWORK
issues: <count>
issue_list:
  - severity: blocker|major|minor
    description: <what is wrong>
    file: <path>
    line: <number>
notes: <optional>
```
"#;

const MINOR_FIXES_TEMPLATE: &str = r#"You are a developer. Apply targeted fixes for the review findings below. Keep the change minimal.

## STORY
{{story_content}}

## FINDINGS
{{issues}}

## FILES IN SCOPE
{{files}}
"#;

const MAJOR_REWORK_TEMPLATE: &str = r#"You are a developer. The review found blocking problems. Rework the implementation to resolve every finding below, then re-run the tests.

## STORY
{{story_content}}

## FINDINGS
{{issues}}

## FILES IN SCOPE
{{files}}
"#;
