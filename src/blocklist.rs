use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;

/// Sender addresses and domains whose mail is refused outright.
#[derive(Debug, Default, Clone)]
pub struct SenderBlocklist {
    entries: HashSet<String>,
}

impl SenderBlocklist {
    /// One address or domain per line; blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(|line| line.trim().to_lowercase())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        SenderBlocklist { entries }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "failed to open blacklist file: {}",
                path.as_ref().display()
            )
        })?;
        let blocklist = Self::parse(&content);
        log::info!(
            "Loaded {} blacklisted emails/domains from {}",
            blocklist.len(),
            path.as_ref().display()
        );
        Ok(blocklist)
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_blocked(&self, sender: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }

        let sender = sender.trim().to_lowercase();
        if self.entries.contains(&sender) {
            return true;
        }

        match sender.rfind('@') {
            Some(at) if at + 1 < sender.len() => self.entries.contains(&sender[at + 1..]),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_blocklist() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "# Test blacklist\nspam@example.com\nUPPERCASE@TEST.COM\n  spaced@email.com  \n# comment line\nvalid@email.com\nbad-domain.org\n"
        )
        .unwrap();

        let list = SenderBlocklist::from_file(file.path()).unwrap();
        assert_eq!(list.len(), 5);

        assert!(list.is_blocked("spam@example.com"));
        assert!(list.is_blocked("SPAM@EXAMPLE.COM"));
        assert!(list.is_blocked("uppercase@test.com"));
        assert!(list.is_blocked("  spaced@email.com  "));
        assert!(list.is_blocked("valid@email.com"));
        assert!(list.is_blocked("anyone@bad-domain.org"));

        assert!(!list.is_blocked("good@example.com"));
        assert!(!list.is_blocked(""));
        assert!(!list.is_blocked("trailing@"));
    }

    #[test]
    fn test_no_file_blocks_nothing() {
        let list = SenderBlocklist::load(None).unwrap();
        assert!(list.is_empty());
        assert!(!list.is_blocked("any@email.com"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = SenderBlocklist::from_file("/non/existent/file.txt").unwrap_err();
        assert!(err.to_string().contains("failed to open blacklist file"));
    }
}
