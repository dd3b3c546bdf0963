use std::fmt;
use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

pub const CODE_GROUPS: usize = 4;
pub const CODE_GROUP_LENGTH: usize = 2;

static CODE_CLEAN_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w]+").unwrap());

/// Strip everything but word characters, so `"12 34-56.78"` and
/// `"12345678"` unlock the same transfer.
pub fn normalize(code: &str) -> String {
    CODE_CLEAN_PATTERN.replace_all(code, "").into_owned()
}

/// The code protecting an anonymous transfer.
///
/// The pretty form is what the sender passes on; the canonical form is what
/// the document is sealed with.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferCode {
    pretty: String,
    canonical: String,
}

impl fmt::Debug for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferCode(..)")
    }
}

impl TransferCode {
    /// Four random groups of two digits
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let groups: Vec<String> = (0..CODE_GROUPS)
            .map(|_| {
                (0..CODE_GROUP_LENGTH)
                    .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
                    .collect()
            })
            .collect();
        Self {
            pretty: groups.join(" "),
            canonical: groups.concat(),
        }
    }

    pub fn from_pretty(pretty: impl Into<String>) -> Self {
        let pretty = pretty.into();
        let canonical = normalize(&pretty);
        Self { pretty, canonical }
    }

    pub fn pretty(&self) -> &str {
        &self.pretty
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}
