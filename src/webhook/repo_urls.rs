//! Repository URL extraction from provider webhook payloads.
//!
//! Every known payload shape is checked independently; a payload may match
//! several shapes at once and all hits are unioned.

use std::collections::BTreeSet;

use serde_json::Value;

use super::ValidationError;

/// Which provider convention a path follows. Only used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    GitHub,
    GitLab,
    Azure,
    /// `repository.git_ssh_url` / `repository.git_http_url`, accepted for
    /// providers that borrow GitLab field names under a GitHub-style key.
    GenericAlias,
}

struct UrlPath {
    shape: PayloadShape,
    path: &'static [&'static str],
}

const URL_PATHS: &[UrlPath] = &[
    UrlPath {
        shape: PayloadShape::GitHub,
        path: &["repository", "git_url"],
    },
    UrlPath {
        shape: PayloadShape::GitHub,
        path: &["repository", "ssh_url"],
    },
    UrlPath {
        shape: PayloadShape::GitHub,
        path: &["repository", "clone_url"],
    },
    UrlPath {
        shape: PayloadShape::GitHub,
        path: &["repository", "url"],
    },
    UrlPath {
        shape: PayloadShape::GitLab,
        path: &["project", "git_http_url"],
    },
    UrlPath {
        shape: PayloadShape::GitLab,
        path: &["project", "git_ssh_url"],
    },
    UrlPath {
        shape: PayloadShape::Azure,
        path: &["resource", "repository", "remoteUrl"],
    },
    // Historical naming: the ssh field is read as the "http alias" and the
    // http field as the "ssh alias". Kept as-is for compatibility.
    UrlPath {
        shape: PayloadShape::GenericAlias,
        path: &["repository", "git_ssh_url"],
    },
    UrlPath {
        shape: PayloadShape::GenericAlias,
        path: &["repository", "git_http_url"],
    },
];

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(payload, |node, key| node.get(*key))
        .and_then(Value::as_str)
}

/// Collect every repository URL mentioned in `payload`.
///
/// Missing fields, nulls and non-string values are skipped. Fails with
/// [`ValidationError::NoRepoUrlFound`] when nothing is found, so callers can
/// reject the request before any side effect.
pub fn affected_repo_urls(payload: &Value) -> Result<BTreeSet<String>, ValidationError> {
    let mut urls = BTreeSet::new();
    for p in URL_PATHS {
        if let Some(url) = lookup(payload, p.path) {
            tracing::trace!(shape = ?p.shape, %url, "repo url found in payload");
            urls.insert(url.to_string());
        }
    }
    if urls.is_empty() {
        return Err(ValidationError::NoRepoUrlFound);
    }
    Ok(urls)
}
