//! Maps SVN author names to Git `Name <email>` identities.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct IdentityMap {
    map: HashMap<String, BString>,
    domain: String,
}

impl IdentityMap {
    pub fn new(domain: &str) -> Self {
        IdentityMap {
            map: HashMap::new(),
            domain: domain.to_owned(),
        }
    }

    /// Loads a map file of `login = Full Name <email>` lines. Empty lines and
    /// `#` comments are skipped.
    pub fn load(path: &Path, domain: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read identity map {}", path.display()))?;
        let mut map = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((login, identity)) = line.split_once('=') else {
                bail!(
                    "{} line {}: expected \"login = Name <email>\", got {:?}",
                    path.display(),
                    lineno + 1,
                    line
                );
            };
            map.insert(
                login.trim().to_owned(),
                BString::from(identity.trim().as_bytes()),
            );
        }
        Ok(IdentityMap {
            map,
            domain: domain.to_owned(),
        })
    }

    /// Resolves an SVN author to a committer identity. Unmapped authors get a
    /// synthesized address in the configured domain; a missing author becomes
    /// `nobody <nobody@localhost>`.
    pub fn resolve(&self, svn_author: Option<&str>) -> BString {
        match svn_author {
            Some(author) if !author.is_empty() => match self.map.get(author) {
                Some(identity) => identity.clone(),
                None => BString::from(format!("{author} <{author}@{}>", self.domain)),
            },
            _ => BString::from("nobody <nobody@localhost>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_resolve_mapped_and_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# committers").unwrap();
        writeln!(file, "jdoe = Joe Doe <jdoe@example.com>").unwrap();
        file.flush().unwrap();

        let identities = IdentityMap::load(file.path(), "example.org").unwrap();
        assert_eq!(
            identities.resolve(Some("jdoe")),
            BString::from("Joe Doe <jdoe@example.com>")
        );
        assert_eq!(
            identities.resolve(Some("other")),
            BString::from("other <other@example.org>")
        );
        assert_eq!(
            identities.resolve(None),
            BString::from("nobody <nobody@localhost>")
        );
        assert_eq!(
            identities.resolve(Some("")),
            BString::from("nobody <nobody@localhost>")
        );
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no equals sign here").unwrap();
        file.flush().unwrap();
        assert!(IdentityMap::load(file.path(), "x").is_err());
    }
}
