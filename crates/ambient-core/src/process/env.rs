//! Runner environment
//!
//! Runners never inherit the control plane's full environment. Only the
//! names and prefixes below pass through; everything a runner needs beyond
//! that is set explicitly.

use std::collections::BTreeMap;
use std::path::Path;

const ALLOWED_NAMES: [&str; 10] = [
    "HOME",
    "PATH",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "GOPATH",
    "GOROOT",
    "SSH_AUTH_SOCK",
];

const ALLOWED_PREFIXES: [&str; 6] = [
    "ANTHROPIC_",
    "CLAUDE_",
    "GOOGLE_",
    "GITHUB_",
    "GITLAB_",
    "GIT_",
];

pub fn is_inheritable(name: &str) -> bool {
    ALLOWED_NAMES.contains(&name) || ALLOWED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Keep only allow-listed variables from `vars`.
pub fn filter_inherited<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| is_inheritable(name))
        .collect()
}

/// Fixed per-session variables layered over the inherited set.
pub struct RunnerContext<'a> {
    pub session_id: &'a str,
    pub port: u16,
    pub workspace: &'a Path,
    pub boss_url: Option<&'a str>,
    pub boss_space: Option<&'a str>,
}

/// Full environment for a runner: filtered inheritance, then the session
/// context, then caller-supplied variables (which win).
pub fn runner_environment<I>(
    inherited: I,
    ctx: &RunnerContext<'_>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = filter_inherited(inherited);
    env.insert("SESSION_ID".into(), ctx.session_id.to_string());
    env.insert("AGUI_PORT".into(), ctx.port.to_string());
    env.insert(
        "WORKSPACE_PATH".into(),
        ctx.workspace.to_string_lossy().into_owned(),
    );
    if let Some(url) = ctx.boss_url {
        env.insert("BOSS_URL".into(), url.to_string());
    }
    if let Some(space) = ctx.boss_space {
        env.insert("BOSS_SPACE".into(), space.to_string());
    }
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
