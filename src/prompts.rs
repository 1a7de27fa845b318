use std::path::Path;

use crate::agent::Phase;
use crate::config::PromptOverrides;
use crate::features::Feature;

/// Substitution variables available to every prompt template.
#[derive(Debug, Default, Clone)]
pub struct PromptVars {
    pub feature_name: String,
    pub feature_id: String,
    pub worktree: String,
    pub project_root: String,
    pub app_url: String,
    pub base_branch: String,
    pub steps: String,
    pub instructions_path: String,
    pub verify_output: String,
}

impl PromptVars {
    pub fn for_feature(
        feature: &Feature,
        worktree: &Path,
        project_root: &Path,
        app_url: &str,
        base_branch: &str,
        instructions_path: &str,
    ) -> Self {
        Self {
            feature_name: feature.name.clone(),
            feature_id: feature.id.to_string(),
            worktree: worktree.display().to_string(),
            project_root: project_root.display().to_string(),
            app_url: app_url.into(),
            base_branch: base_branch.into(),
            steps: numbered_steps(&feature.steps),
            instructions_path: instructions_path.into(),
            verify_output: String::new(),
        }
    }
}

/// Render `{{VAR}}` placeholders. Unknown placeholders are left in place so
/// a typo in a custom template is visible in the agent transcript instead
/// of silently vanishing.
pub fn render(template: &str, vars: &PromptVars) -> String {
    template
        .replace("{{FEATURE_NAME}}", &vars.feature_name)
        .replace("{{FEATURE_ID}}", &vars.feature_id)
        .replace("{{WORKTREE}}", &vars.worktree)
        .replace("{{PROJECT_ROOT}}", &vars.project_root)
        .replace("{{APP_URL}}", &vars.app_url)
        .replace("{{BASE_BRANCH}}", &vars.base_branch)
        .replace("{{STEPS}}", &vars.steps)
        .replace("{{INSTRUCTIONS_PATH}}", &vars.instructions_path)
        .replace("{{VERIFY_OUTPUT}}", &vars.verify_output)
}

/// Template resolution order: a prompt file under `.autodev/prompts/`,
/// then the inline config override, then the built-in default.
pub fn resolve_template(project_dir: &Path, phase: Phase, overrides: &PromptOverrides) -> String {
    let name = match phase {
        Phase::Implementation => "implementation",
        Phase::Verification => "verification",
        Phase::Fix => "fix",
    };
    let file = project_dir.join(".autodev").join("prompts").join(format!("{name}.md"));
    if let Ok(content) = std::fs::read_to_string(&file) {
        if !content.trim().is_empty() {
            return content;
        }
    }
    let inline = match phase {
        Phase::Implementation => &overrides.implementation,
        Phase::Verification => &overrides.verification,
        Phase::Fix => &overrides.fix,
    };
    if let Some(template) = inline {
        if !template.trim().is_empty() {
            return template.clone();
        }
    }
    builtin_template(phase).to_string()
}

pub fn builtin_template(phase: Phase) -> &'static str {
    match phase {
        Phase::Implementation => IMPLEMENTATION_TEMPLATE,
        Phase::Verification => VERIFICATION_TEMPLATE,
        Phase::Fix => FIX_TEMPLATE,
    }
}

fn numbered_steps(steps: &[String]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

const IMPLEMENTATION_TEMPLATE: &str = "\
You are implementing feature #{{FEATURE_ID}}: {{FEATURE_NAME}}.

Working directory: {{WORKTREE}}
Stay inside this directory for every file you create or edit. Do not install
dependencies; everything you need is already present. The application is
reachable at {{APP_URL}} and your branch will be merged into {{BASE_BRANCH}}
when you are done.

Read {{INSTRUCTIONS_PATH}} for project conventions. Where it conflicts with
these instructions, these instructions win.

Acceptance steps to satisfy:
{{STEPS}}

Implement the feature, then check your work with non-browser tooling only
(unit tests, curl, CLI checks). Do not start or drive a browser. Commit as
you go with clear messages.
";

const VERIFICATION_TEMPLATE: &str = "\
You are verifying feature #{{FEATURE_ID}}: {{FEATURE_NAME}}.

Working directory: {{PROJECT_ROOT}}
The feature has been merged into {{BASE_BRANCH}} and the application is
reachable at {{APP_URL}}. You must NOT modify any source file; you are
checking, not fixing.

Read {{INSTRUCTIONS_PATH}} for how to run the checks. Where it conflicts
with these instructions, these instructions win.

Check each acceptance step:
{{STEPS}}

For every step print exactly one line in the form:
STEP <n>: PASS - <short evidence>
or
STEP <n>: FAIL - <what went wrong>

Finish with a single line: VERDICT: PASS or VERDICT: FAIL.
";

const FIX_TEMPLATE: &str = "\
You are fixing feature #{{FEATURE_ID}}: {{FEATURE_NAME}} after a failed
verification.

Working directory: {{WORKTREE}}
Stay inside this directory. Do not install dependencies. Read
{{INSTRUCTIONS_PATH}} for project conventions; these instructions win on
any conflict.

Acceptance steps that must pass:
{{STEPS}}

The verification run ended like this:
{{VERIFY_OUTPUT}}

Diagnose the failures, fix them, and re-check your work with non-browser
tooling only. Commit your changes.
";
