//! Repository URL canonicalization and synthetic package ids.
//!
//! Registry packages and community extensions refer to the same repository
//! through many URL shapes (raw file links, `.git` clone URLs, trailing
//! slashes, mixed case). Both sides are reduced to one canonical form before
//! they are compared.

use regex::Regex;
use std::sync::LazyLock;

/// `scheme:` `//netloc` `path` `?query` `#fragment`, each part optional.
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:([a-z][a-z0-9+.\-]*):)?(?://([^/?#]*))?([^?#]*)(?:\?[^#]*)?(?:#.*)?$").unwrap()
});

/// Hosts whose repositories can be matched or synthesized.
pub const SUPPORTED_HOSTS: &[&str] = &[
    "github.com",
    "githubusercontent.com",
    "gist.github.com",
    "gitee.com",
    "git.mmaker.moe",
];

/// Split view of a URL, enough for canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: Option<String>,
    pub netloc: Option<String>,
    pub path: String,
}

impl UrlParts {
    pub fn parse(url: &str) -> Self {
        match URL_RE.captures(url) {
            Some(caps) => Self {
                scheme: caps.get(1).map(|m| m.as_str().to_string()),
                netloc: caps.get(2).map(|m| m.as_str().to_string()),
                path: caps.get(3).map_or("", |m| m.as_str()).to_string(),
            },
            None => Self {
                scheme: None,
                netloc: None,
                path: url.to_string(),
            },
        }
    }

    pub fn host(&self) -> &str {
        self.netloc.as_deref().unwrap_or("")
    }

    /// Non-empty path segments.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Rebuild without query and fragment.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(scheme) = &self.scheme {
            out.push_str(scheme);
            out.push(':');
        }
        if let Some(netloc) = &self.netloc {
            out.push_str("//");
            out.push_str(netloc);
        }
        out.push_str(&self.path);
        out
    }
}

fn strip_trailing(mut url: &str) -> &str {
    loop {
        let trimmed = url.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        if trimmed.len() == url.len() {
            return url;
        }
        url = trimmed;
    }
}

/// Reduce any supported URL variant to its canonical repository URL.
pub fn normalize_repository_url(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let parts = UrlParts::parse(strip_trailing(&lowered));
    let segments = parts.segments();

    match parts.host() {
        "raw.githubusercontent.com" if segments.len() >= 2 => {
            format!("https://github.com/{}/{}", segments[0], segments[1])
        }
        "gist.githubusercontent.com" if segments.len() >= 2 => {
            format!("https://gist.github.com/{}/{}", segments[0], segments[1])
        }
        _ => parts.render(),
    }
}

pub fn is_supported_repo_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    SUPPORTED_HOSTS.iter().any(|host| lowered.contains(host))
}

fn id_part(value: &str) -> String {
    value.to_lowercase().replace('-', "_")
}

/// Deterministic id for a package that only the community map knows about.
///
/// Expects an already canonical URL.
pub fn generate_manager_package_id(normalized_url: &str) -> String {
    let parts = UrlParts::parse(normalized_url);
    let host = parts.host();
    let segments = parts.segments();

    if host.contains("gist.github.com") && segments.len() >= 2 {
        return format!("manager_gist_{}", segments[1]);
    }
    if host.contains("github.com") && segments.len() >= 2 {
        return format!("manager_{}_{}", id_part(segments[0]), id_part(segments[1]));
    }

    let domain = host.replace(['.', '-'], "_");
    if segments.len() >= 2 {
        return format!(
            "manager_{domain}_{}_{}",
            id_part(segments[0]),
            id_part(segments[1])
        );
    }
    format!("manager_{domain}")
}

/// `(owner, repository)` path segments of a canonical URL, when present.
pub fn repo_owner_and_name(normalized_url: &str) -> (Option<String>, Option<String>) {
    let parts = UrlParts::parse(normalized_url);
    let segments = parts.segments();
    let owner = segments.first().map(|s| s.to_string());
    let name = if segments.len() >= 2 {
        segments.last().map(|s| s.to_string())
    } else {
        None
    };
    (owner, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_github() {
        assert_eq!(
            normalize_repository_url("  https://GitHub.com/User/Repo.git/ "),
            "https://github.com/user/repo"
        );
        assert_eq!(
            normalize_repository_url("https://github.com/user/repo/"),
            "https://github.com/user/repo"
        );
    }

    #[test]
    fn test_normalize_raw_github_to_repo() {
        assert_eq!(
            normalize_repository_url(
                "https://raw.githubusercontent.com/User/Repo/main/nodes/__init__.py"
            ),
            "https://github.com/user/repo"
        );
    }

    #[test]
    fn test_normalize_gist_raw_to_canonical() {
        assert_eq!(
            normalize_repository_url(
                "https://gist.githubusercontent.com/alice/abc123/raw/deadbeef/node.py"
            ),
            "https://gist.github.com/alice/abc123"
        );
    }

    #[test]
    fn test_normalize_drops_query_and_fragment() {
        assert_eq!(
            normalize_repository_url("https://gitee.com/a/b?tab=readme#top"),
            "https://gitee.com/a/b"
        );
    }

    #[test]
    fn test_normalize_without_scheme_keeps_path() {
        assert_eq!(normalize_repository_url("github.com/x/y"), "github.com/x/y");
    }

    #[test]
    fn test_supported_hosts() {
        assert!(is_supported_repo_url("https://github.com/a/b"));
        assert!(is_supported_repo_url("https://GITEE.com/a/b"));
        assert!(is_supported_repo_url("https://git.mmaker.moe/a/b"));
        assert!(!is_supported_repo_url("https://gitlab.com/a/b"));
        assert!(!is_supported_repo_url("https://example.com/node.py"));
    }

    #[test]
    fn test_manager_ids() {
        assert_eq!(
            generate_manager_package_id("https://github.com/some-user/My-Repo"),
            "manager_some_user_my_repo"
        );
        assert_eq!(
            generate_manager_package_id("https://gist.github.com/alice/abc123"),
            "manager_gist_abc123"
        );
        assert_eq!(
            generate_manager_package_id("https://git.mmaker.moe/user/repo"),
            "manager_git_mmaker_moe_user_repo"
        );
        assert_eq!(
            generate_manager_package_id("https://gitee.com"),
            "manager_gitee_com"
        );
    }

    #[test]
    fn test_owner_and_name() {
        let (owner, name) = repo_owner_and_name("https://github.com/x/y");
        assert_eq!(owner.as_deref(), Some("x"));
        assert_eq!(name.as_deref(), Some("y"));

        let (owner, name) = repo_owner_and_name("https://gitee.com/solo");
        assert_eq!(owner.as_deref(), Some("solo"));
        assert!(name.is_none());
    }
}
