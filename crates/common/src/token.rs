//! Token paths: short public handles that route to transfers and inboxes

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;

use crate::store::Transaction;
use crate::{Error, Result};

pub const MIN_LENGTH: usize = 4;
pub const MAX_LENGTH: usize = 32;

/// Characters generated tokens start with
const LEADING: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
/// Characters for the rest of a generated token
const TRAILING: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";

const GENERATE_ATTEMPTS: usize = 16;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^{}$",
        token_pattern(MIN_LENGTH, MAX_LENGTH)
    ))
    .unwrap()
});

/// Regex fragment matching a token of `min..=max` characters
pub(crate) fn token_pattern(min: usize, max: usize) -> String {
    format!("[A-Z0-9][A-Za-z0-9_]{{{},{}}}", min - 1, max - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenCategory {
    Anonymous,
    Inbox,
    Dispatch,
    Deposit,
    Organization,
}

impl TokenCategory {
    /// Allowed lengths for paths of this category
    pub fn bounds(&self) -> RangeInclusive<usize> {
        match self {
            TokenCategory::Anonymous => 5..=8,
            TokenCategory::Dispatch | TokenCategory::Deposit => 6..=12,
            TokenCategory::Inbox | TokenCategory::Organization => MIN_LENGTH..=MAX_LENGTH,
        }
    }

    fn generated_length(&self) -> usize {
        match self {
            TokenCategory::Anonymous => 6,
            TokenCategory::Dispatch | TokenCategory::Deposit => 8,
            TokenCategory::Inbox | TokenCategory::Organization => 8,
        }
    }
}

impl fmt::Display for TokenCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenCategory::Anonymous => "anonymous",
            TokenCategory::Inbox => "inbox",
            TokenCategory::Dispatch => "dispatch",
            TokenCategory::Deposit => "deposit",
            TokenCategory::Organization => "organization",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub path: String,
    pub category: TokenCategory,
    pub created: DateTime<Utc>,
}

/// Whether `path` fits the global token grammar
pub fn is_valid_path(path: &str) -> bool {
    TOKEN_PATTERN.is_match(path)
}

fn random_path(length: usize) -> String {
    let mut rng = rand::rng();
    let mut path = String::with_capacity(length);
    path.push(LEADING[rng.random_range(0..LEADING.len())] as char);
    for _ in 1..length {
        path.push(TRAILING[rng.random_range(0..TRAILING.len())] as char);
    }
    path
}

#[derive(Debug, Clone, Default)]
pub struct TokenService;

impl TokenService {
    pub fn new() -> Self {
        Self
    }

    /// Allocate a fresh random path in `category`.
    pub async fn generate(&self, tx: &mut dyn Transaction, category: TokenCategory) -> Result<Token> {
        for _ in 0..GENERATE_ATTEMPTS {
            let path = random_path(category.generated_length());
            if tx.token(&path).await?.is_none() {
                return self.insert(tx, path, category).await;
            }
            tracing::debug!("token collision on {}, retrying", path);
        }
        Err(Error::TokenUnavailable(format!(
            "no free {} token after {} attempts",
            category, GENERATE_ATTEMPTS
        )))
    }

    /// Claim a caller-chosen path.
    pub async fn create(
        &self,
        tx: &mut dyn Transaction,
        path: &str,
        category: TokenCategory,
    ) -> Result<Token> {
        if !is_valid_path(path) || !category.bounds().contains(&path.len()) {
            return Err(Error::InvalidToken(path.to_string()));
        }
        if tx.token(path).await?.is_some() {
            return Err(Error::TokenUnavailable(path.to_string()));
        }
        self.insert(tx, path.to_string(), category).await
    }

    pub async fn retrieve_by_path(&self, tx: &mut dyn Transaction, path: &str) -> Result<Option<Token>> {
        if !is_valid_path(path) {
            return Ok(None);
        }
        Ok(tx.token(path).await?)
    }

    async fn insert(
        &self,
        tx: &mut dyn Transaction,
        path: String,
        category: TokenCategory,
    ) -> Result<Token> {
        let token = Token {
            path,
            category,
            created: Utc::now(),
        };
        tx.create_token(&token).await?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityStore, MemoryEntityStore};

    #[test]
    fn test_path_grammar() {
        assert!(is_valid_path("ABCD"));
        assert!(is_valid_path("7x_Yz9"));
        assert!(is_valid_path(&format!("A{}", "b".repeat(31))));

        assert!(!is_valid_path("ABC"));
        assert!(!is_valid_path("abcde"));
        assert!(!is_valid_path("_ABCD"));
        assert!(!is_valid_path("AB-CD"));
        assert!(!is_valid_path(&format!("A{}", "b".repeat(32))));
    }

    #[test]
    fn test_generated_paths_fit_their_category() {
        for category in [
            TokenCategory::Anonymous,
            TokenCategory::Inbox,
            TokenCategory::Dispatch,
            TokenCategory::Deposit,
            TokenCategory::Organization,
        ] {
            let path = random_path(category.generated_length());
            assert!(is_valid_path(&path), "{}", path);
            assert!(category.bounds().contains(&path.len()));
        }
    }

    #[tokio::test]
    async fn test_create_rejects_taken_and_invalid() {
        let store = MemoryEntityStore::new();
        let mut tx = store.begin().await.unwrap();
        let tokens = TokenService::new();

        tokens
            .create(tx.as_mut(), "INBOX1", TokenCategory::Inbox)
            .await
            .unwrap();

        assert!(matches!(
            tokens.create(tx.as_mut(), "INBOX1", TokenCategory::Inbox).await,
            Err(Error::TokenUnavailable(_))
        ));
        assert!(matches!(
            tokens.create(tx.as_mut(), "inbox2", TokenCategory::Inbox).await,
            Err(Error::InvalidToken(_))
        ));
        // too long for an anonymous token
        assert!(matches!(
            tokens
                .create(tx.as_mut(), "ANONYMOUS1", TokenCategory::Anonymous)
                .await,
            Err(Error::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_and_lookup() {
        let store = MemoryEntityStore::new();
        let mut tx = store.begin().await.unwrap();
        let tokens = TokenService::new();

        let token = tokens
            .generate(tx.as_mut(), TokenCategory::Anonymous)
            .await
            .unwrap();
        let found = tokens
            .retrieve_by_path(tx.as_mut(), &token.path)
            .await
            .unwrap();

        assert_eq!(found, Some(token));
    }
}
