// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Slim file pruning patterns.

A pattern set is a list of glob patterns, one per line. Lines starting
with `!` are preserve-patterns overriding deletes; `#` comments and blank
lines are ignored. A path is removed iff it matches at least one delete
pattern and no preserve pattern.
*/

use {
    crate::error::{BuildError, Result},
    glob::Pattern,
};

/// The built-in pattern set applied when a recipe enables `slim`:
/// documentation, manuals, and locales, while keeping copyright files.
pub const DEFAULT_SLIM_PATTERNS: &str = "\
# Documentation.
/usr/share/doc/*
!/usr/share/doc/*/copyright
/usr/share/man/*
/usr/share/info/*
/usr/share/groff/*
/usr/share/lintian/*
# Locales.
/usr/share/locale/*
!/usr/share/locale/locale.alias
";

/// A parsed slim pattern set.
#[derive(Clone, Debug, Default)]
pub struct SlimPatterns {
    delete: Vec<Pattern>,
    preserve: Vec<Pattern>,
}

impl SlimPatterns {
    /// Parse a pattern file.
    pub fn parse(text: &str) -> Result<Self> {
        let mut slf = Self::default();

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (list, pattern) = match line.strip_prefix('!') {
                Some(preserved) => (&mut slf.preserve, preserved),
                None => (&mut slf.delete, line),
            };

            list.push(Pattern::new(pattern).map_err(|e| {
                BuildError::RecipeMalformed(format!("bad slim pattern {:?}: {}", pattern, e))
            })?);
        }

        Ok(slf)
    }

    /// The built-in default set.
    pub fn default_set() -> Self {
        Self::parse(DEFAULT_SLIM_PATTERNS).expect("built-in patterns parse")
    }

    /// Whether a path should be deleted.
    pub fn should_remove(&self, path: &str) -> bool {
        if !self.delete.iter().any(|p| p.matches(path)) {
            return false;
        }

        !self.preserve.iter().any(|p| p.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_and_preserve_precedence() -> Result<()> {
        let patterns = SlimPatterns::parse(
            "# docs\n/usr/share/doc/*\n!/usr/share/doc/*/copyright\n\n/usr/share/man/*\n",
        )?;

        assert!(patterns.should_remove("/usr/share/doc/dash/changelog.gz"));
        assert!(!patterns.should_remove("/usr/share/doc/dash/copyright"));
        assert!(patterns.should_remove("/usr/share/man/man1/dash.1.gz"));
        assert!(!patterns.should_remove("/usr/bin/dash"));

        Ok(())
    }

    #[test]
    fn comments_and_blanks_ignored() -> Result<()> {
        let patterns = SlimPatterns::parse("\n# only a comment\n\n")?;

        assert!(!patterns.should_remove("/usr/share/doc/x"));

        Ok(())
    }

    #[test]
    fn default_set_prunes_docs_keeps_copyright() {
        let patterns = SlimPatterns::default_set();

        assert!(patterns.should_remove("/usr/share/doc/bash/README.gz"));
        assert!(!patterns.should_remove("/usr/share/doc/bash/copyright"));
        assert!(patterns.should_remove("/usr/share/locale/de/LC_MESSAGES/bash.mo"));
        assert!(!patterns.should_remove("/usr/share/locale/locale.alias"));
        assert!(!patterns.should_remove("/usr/bin/bash"));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(SlimPatterns::parse("/usr/[invalid\n").is_err());
    }
}
