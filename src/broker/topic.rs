//! Topic naming
//!
//! A `Topic` is the broadcast group a connection joins for its whole lifetime.
//! It is derived from the request path: `/1.0/` and `1.0` name the same topic,
//! and the bare root path names the `/` topic.

use std::fmt;

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub const ROOT: &'static str = "/";

    /// Derive the topic for a request path. Leading and trailing slashes are ignored.
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            Self(Self::ROOT.to_string())
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The request path a client connects to for this topic.
    pub fn path(&self) -> String {
        if self.0 == Self::ROOT {
            Self::ROOT.to_string()
        } else {
            format!("/{}/", self.0)
        }
    }

    /// Resolve this topic's path against a relay base URL, keeping any path
    /// prefix the base already has.
    pub fn endpoint(&self, base: &Url) -> Result<Url, url::ParseError> {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let dir = format!("{}/", base.path());
            base.set_path(&dir);
        }
        base.join(self.path().trim_start_matches('/'))
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::from_path(value)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
