//! Template variable resolution for user run configurations.
//!
//! Configuration text may reference `${{ VAR }}` tokens which are substituted
//! before the configuration is parsed. Resolution is a single pass over the
//! raw text: substituted values are never re-scanned, so a value that itself
//! contains the delimiter cannot trigger further expansion. An unrecognized
//! variable fails the whole resolution — an unresolved token left inside a
//! run script is worse than a loud failure.

use std::sync::LazyLock;

use chrono::{DateTime, Local};

use crate::error::Error;

/// Read-only git facts supplied by the git collaborator.
///
/// Each fact is optional; a missing fact only becomes an error when a token
/// asks for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitFacts {
    pub branch: Option<String>,
    pub remote_url: Option<String>,
    pub latest_tag: Option<String>,
}

/// Values available to one resolution pass.
///
/// Assembled per invocation and threaded explicitly — there is no ambient
/// process-wide state, so tests can resolve against several contexts in one
/// binary.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub now: DateTime<Local>,
    /// Invoking user's name, as recorded in run history.
    pub user: String,
    /// Invoking user's stable identifier (ORCID-like).
    pub user_id: String,
    /// Absolute path of the repository root.
    pub repo_root: String,
    /// Directory that will hold the resolved configuration (the job dir).
    pub config_dir: String,
    /// Path of the original configuration file being resolved.
    pub source_config: String,
    /// Local registry access token, when one is installed.
    pub token: Option<String>,
    pub git: GitFacts,
}

/// Recognized variables, parsed from token names.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Variable {
    Date,
    DateTime(Option<String>),
    User,
    UserId,
    RepoDir,
    ConfigDir,
    SourceConfig,
    Token,
    GitBranch,
    GitRemote,
    GitTag,
}

impl Variable {
    fn parse(name: &str) -> Option<Self> {
        if let Some(fmt) = name.strip_prefix("DATETIME-") {
            return Some(Self::DateTime(Some(fmt.to_string())));
        }
        match name {
            "DATE" => Some(Self::Date),
            "DATETIME" => Some(Self::DateTime(None)),
            "USER" => Some(Self::User),
            "USER_ID" => Some(Self::UserId),
            "REPO_DIR" => Some(Self::RepoDir),
            "CONFIG_DIR" => Some(Self::ConfigDir),
            "SOURCE_CONFIG" => Some(Self::SourceConfig),
            "TOKEN" => Some(Self::Token),
            "GIT_BRANCH" => Some(Self::GitBranch),
            "GIT_REMOTE" => Some(Self::GitRemote),
            "GIT_TAG" => Some(Self::GitTag),
            _ => None,
        }
    }

    fn resolve(&self, name: &str, ctx: &TemplateContext) -> Result<String, Error> {
        let unavailable = |reason: &str| Error::TemplateValueUnavailable {
            token: name.to_string(),
            reason: reason.to_string(),
        };
        match self {
            Self::Date => Ok(format_datetime(&ctx.now, "%Y%m%d")),
            Self::DateTime(None) => Ok(format_datetime(&ctx.now, "%Y-%m-%dT%H:%M:%S")),
            Self::DateTime(Some(fmt)) => Ok(format_datetime(&ctx.now, fmt)),
            Self::User => Ok(ctx.user.clone()),
            Self::UserId => Ok(ctx.user_id.clone()),
            Self::RepoDir => Ok(ctx.repo_root.clone()),
            Self::ConfigDir => Ok(ctx.config_dir.clone()),
            Self::SourceConfig => Ok(ctx.source_config.clone()),
            Self::Token => ctx
                .token
                .clone()
                .ok_or_else(|| unavailable("no registry access token installed")),
            Self::GitBranch => ctx
                .git
                .branch
                .clone()
                .ok_or_else(|| unavailable("no current git branch")),
            Self::GitRemote => ctx
                .git
                .remote_url
                .clone()
                .ok_or_else(|| unavailable("configured git remote has no URL")),
            Self::GitTag => ctx
                .git
                .latest_tag
                .clone()
                .ok_or_else(|| unavailable("repository has no git tags")),
        }
    }
}

/// Substitute every recognized `${{ VAR }}` token in `text`.
///
/// Fails fast on the first unknown variable, before producing any output.
pub fn resolve(text: &str, ctx: &TemplateContext) -> Result<String, Error> {
    static TOKEN_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").unwrap());

    // Parse all tokens first so an unknown variable late in the text fails
    // before any substitution work is visible to the caller.
    let mut tokens = Vec::new();
    for caps in TOKEN_RE.captures_iter(text) {
        let whole = caps.get(0).expect("regex match");
        let name = caps.get(1).expect("capture group").as_str();
        let variable = Variable::parse(name).ok_or_else(|| Error::UnknownTemplateVariable {
            token: name.to_string(),
        })?;
        tokens.push((whole.start(), whole.end(), name, variable));
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, name, variable) in tokens {
        out.push_str(&text[cursor..start]);
        out.push_str(&variable.resolve(name, ctx)?);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// Best-effort strftime-style formatting.
///
/// Known specifiers are delegated to chrono one at a time; anything else
/// (including a trailing `%`) passes through literally rather than failing
/// the run over a format typo.
fn format_datetime(now: &DateTime<Local>, fmt: &str) -> String {
    const KNOWN: &[char] = &[
        'Y', 'y', 'm', 'd', 'e', 'j', 'H', 'I', 'M', 'S', 'f', 'p', 'a', 'A', 'b', 'B', 's', 'z',
        '%',
    ];

    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(spec) if KNOWN.contains(&spec) => {
                out.push_str(&now.format(&format!("%{spec}")).to_string());
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
