//! Directive builder: the text handed to the agent on stdin.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::protocol::{
    COMMIT_END, COMMIT_START, FLAG_END, FLAG_START, NOTES_END, NOTES_START,
};
use crate::core::types::Task;

const DIRECTIVE_TEMPLATE: &str = include_str!("prompts/directive.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("directive", DIRECTIVE_TEMPLATE)
        .expect("directive template should be valid");
    env
});

/// Where the agent is expected to push its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub remote: String,
    pub branch: String,
}

/// Render the directive for `task`, including the fixed completion protocol.
pub fn build_directive(task: &Task, target: &PushTarget) -> Result<String> {
    let template = ENGINE.get_template("directive")?;
    let rendered = template.render(context! {
        title => task.title.trim(),
        description => non_empty(task.description.as_deref()),
        area => non_empty(task.area.as_deref()),
        notes => non_empty(task.notes.as_deref()),
        branch => target.branch.as_str(),
        remote => target.remote.as_str(),
        flag_start => FLAG_START,
        flag_end => FLAG_END,
        commit_start => COMMIT_START,
        commit_end => COMMIT_END,
        notes_start => NOTES_START,
        notes_end => NOTES_END,
    })?;
    Ok(rendered)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
