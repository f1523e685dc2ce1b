// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version string handling. */

use {
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing string to integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("the epoch component has non-digit characters: {0}")]
    EpochNonNumeric(String),

    #[error("upstream_version component has illegal character: {0}")]
    UpstreamVersionIllegalChar(String),

    #[error("debian_revision component has illegal character: {0}")]
    DebianRevisionIllegalChar(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A Debian package version.
///
/// The format is `[epoch:]upstream_version[-debian_revision]` with sorting
/// rules defined at
/// <https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream_version: String,
    debian_revision: Option<String>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        // Epoch is the part before the first colon, if present. The debian
        // revision is discovered by splitting on the last hyphen.

        let (epoch, remainder) = match s.find(':') {
            Some(pos) => (Some(&s[0..pos]), &s[pos + 1..]),
            None => (None, s),
        };

        let (upstream, debian) = match remainder.rfind('-') {
            Some(pos) => (&remainder[0..pos], Some(&remainder[pos + 1..])),
            None => (remainder, None),
        };

        let epoch = match epoch {
            Some(epoch) => {
                if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) {
                    return Err(VersionError::EpochNonNumeric(s.to_string()));
                }

                Some(u32::from_str(epoch)?)
            }
            None => None,
        };

        // upstream_version may contain alphanumerics and `. + ~`; hyphens
        // only when a debian_revision is present, colons only when an epoch
        // is present.
        if upstream.is_empty()
            || !upstream.chars().all(|c| match c {
                c if c.is_ascii_alphanumeric() => true,
                '.' | '+' | '~' => true,
                '-' => debian.is_some(),
                ':' => epoch.is_some(),
                _ => false,
            })
        {
            return Err(VersionError::UpstreamVersionIllegalChar(s.to_string()));
        }

        let debian_revision = match debian {
            Some(debian) => {
                if debian.is_empty()
                    || !debian.chars().all(|c| match c {
                        c if c.is_ascii_alphanumeric() => true,
                        '+' | '.' | '~' => true,
                        _ => false,
                    })
                {
                    return Err(VersionError::DebianRevisionIllegalChar(s.to_string()));
                }

                Some(debian.to_string())
            }
            None => None,
        };

        Ok(Self {
            epoch,
            upstream_version: upstream.to_string(),
            debian_revision,
        })
    }

    /// The explicit `epoch` component, if present.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The `epoch` component, defaulting to `0` when absent.
    pub fn epoch_assumed(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    /// The `upstream_version` component.
    pub fn upstream_version(&self) -> &str {
        &self.upstream_version
    }

    /// The `debian_revision` component, if present.
    pub fn debian_revision(&self) -> Option<&str> {
        self.debian_revision.as_deref()
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }

        f.write_str(&self.upstream_version)?;

        if let Some(revision) = &self.debian_revision {
            write!(f, "-{}", revision)?;
        }

        Ok(())
    }
}

/// Sort weight of a character within a non-digit run.
///
/// Tilde sorts before anything, including the end of the string. Letters
/// sort before all other characters.
fn char_weight(c: Option<char>) -> i32 {
    match c {
        Some('~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn lexical_compare(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();

    loop {
        let (a_char, b_char) = (a_chars.next(), b_chars.next());

        if a_char.is_none() && b_char.is_none() {
            return Ordering::Equal;
        }

        match char_weight(a_char).cmp(&char_weight(b_char)) {
            Ordering::Equal => {}
            res => return res,
        }
    }
}

/// Split a string before its first digit character.
fn split_at_first_digit(s: &str) -> (&str, &str) {
    match s.find(|c: char| c.is_ascii_digit()) {
        Some(pos) => (&s[0..pos], &s[pos..]),
        None => (s, ""),
    }
}

/// Split the leading digit run off a string, evaluating it numerically.
///
/// An empty run counts as zero.
fn split_leading_number(s: &str) -> (u64, &str) {
    let pos = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());

    let numeric = if pos == 0 {
        0
    } else {
        u64::from_str(&s[0..pos]).expect("digit run parses")
    };

    (numeric, &s[pos..])
}

/// Compare one version component (upstream or revision) using Debian rules.
///
/// Alternates between a modified lexical comparison of non-digit runs and a
/// numeric comparison of digit runs until both inputs are exhausted.
fn compare_component(a: &str, b: &str) -> Ordering {
    let mut a_remaining = a;
    let mut b_remaining = b;

    loop {
        let (a_prefix, a_rest) = split_at_first_digit(a_remaining);
        let (b_prefix, b_rest) = split_at_first_digit(b_remaining);

        match lexical_compare(a_prefix, b_prefix) {
            Ordering::Equal => {}
            res => return res,
        }

        let (a_number, a_rest) = split_leading_number(a_rest);
        let (b_number, b_rest) = split_leading_number(b_rest);

        match a_number.cmp(&b_number) {
            Ordering::Equal => {}
            res => return res,
        }

        if a_rest.is_empty() && b_rest.is_empty() {
            return Ordering::Equal;
        }

        a_remaining = a_rest;
        b_remaining = b_rest;
    }
}

impl PartialOrd<Self> for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Epoch numerically, then upstream, then revision. A missing
        // revision is equivalent to `0`.
        self.epoch_assumed()
            .cmp(&other.epoch_assumed())
            .then_with(|| compare_component(&self.upstream_version, &other.upstream_version))
            .then_with(|| {
                compare_component(
                    self.debian_revision.as_deref().unwrap_or("0"),
                    other.debian_revision.as_deref().unwrap_or("0"),
                )
            })
    }
}
