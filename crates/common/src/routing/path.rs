use std::sync::LazyLock;

use regex::Regex;

use crate::token::{token_pattern, MAX_LENGTH, MIN_LENGTH};

static TOKEN_PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?:/([0-9]+))?/({})(?:(\.zip)|/([^/]+))?$",
        token_pattern(MIN_LENGTH, MAX_LENGTH)
    ))
    .unwrap()
});

/// What a token path asks for once the transfer is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The single file, or an archive when there are several
    Default,
    /// Always an archive
    Archive,
    /// One file by name
    File(String),
}

/// A request path of the form `[/code]/TOKEN[.zip | /filename]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPath {
    pub code: Option<String>,
    pub token: String,
    pub target: Target,
}

impl TokenPath {
    pub fn parse(path: &str) -> Option<Self> {
        let captures = TOKEN_PATH_PATTERN.captures(path)?;
        let target = match (captures.get(3), captures.get(4)) {
            (Some(_), _) => Target::Archive,
            (None, Some(name)) => Target::File(name.as_str().to_string()),
            (None, None) => Target::Default,
        };
        Some(Self {
            code: captures.get(1).map(|m| m.as_str().to_string()),
            token: captures.get(2)?.as_str().to_string(),
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_token() {
        let path = TokenPath::parse("/AB12cd").unwrap();
        assert_eq!(path.code, None);
        assert_eq!(path.token, "AB12cd");
        assert_eq!(path.target, Target::Default);
    }

    #[test]
    fn test_code_and_targets() {
        let path = TokenPath::parse("/12345678/AB12cd").unwrap();
        assert_eq!(path.code.as_deref(), Some("12345678"));
        assert_eq!(path.target, Target::Default);

        let path = TokenPath::parse("/12345678/AB12cd.zip").unwrap();
        assert_eq!(path.target, Target::Archive);

        let path = TokenPath::parse("/12345678/AB12cd/report.pdf").unwrap();
        assert_eq!(path.target, Target::File("report.pdf".into()));
    }

    #[test]
    fn test_unmatched() {
        for path in [
            "",
            "/",
            "/abc12",
            "/AB",
            "/_status/livez",
            "/AB12cd/nested/file",
            "/AB12cd.tar",
        ] {
            assert!(TokenPath::parse(path).is_none(), "{}", path);
        }
    }
}
