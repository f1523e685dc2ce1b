// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The Debian package relationship meta language.

Parses dependency expressions like `libc6 (>= 2.36), default-mta |
mail-transport-agent` into an AST. See
<https://www.debian.org/doc/debian-policy/ch-relationships.html>.
*/

use {
    crate::{
        error::{BuildError, Result},
        version::PackageVersion,
    },
    std::cmp::Ordering,
    std::fmt::{Display, Formatter},
};

/// A version comparison operator in a relation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VersionConstraint {
    /// `<<` strictly earlier.
    StrictlyEarlier,
    /// `<=` earlier or equal.
    EarlierOrEqual,
    /// `=` exactly equal.
    ExactlyEqual,
    /// `>=` later or equal.
    LaterOrEqual,
    /// `>>` strictly later.
    StrictlyLater,
}

impl VersionConstraint {
    fn parse(s: &str) -> Result<Self> {
        // `<` and `>` are deprecated aliases for `<=` and `>=`.
        Ok(match s {
            "<<" => Self::StrictlyEarlier,
            "<=" | "<" => Self::EarlierOrEqual,
            "=" => Self::ExactlyEqual,
            ">=" | ">" => Self::LaterOrEqual,
            ">>" => Self::StrictlyLater,
            _ => {
                return Err(BuildError::DependencyParse(format!(
                    "unknown version constraint: {}",
                    s
                )))
            }
        })
    }

    /// Whether `candidate` standing in relation to `wanted` satisfies this
    /// constraint. e.g. for `pkg (>= 1.2)`, `wanted` is `1.2`.
    pub fn satisfied_by(&self, candidate: &PackageVersion, wanted: &PackageVersion) -> bool {
        let ordering = candidate.cmp(wanted);

        match self {
            Self::StrictlyEarlier => ordering == Ordering::Less,
            Self::EarlierOrEqual => ordering != Ordering::Greater,
            Self::ExactlyEqual => ordering == Ordering::Equal,
            Self::LaterOrEqual => ordering != Ordering::Less,
            Self::StrictlyLater => ordering == Ordering::Greater,
        }
    }
}

impl Display for VersionConstraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StrictlyEarlier => "<<",
            Self::EarlierOrEqual => "<=",
            Self::ExactlyEqual => "=",
            Self::LaterOrEqual => ">=",
            Self::StrictlyLater => ">>",
        })
    }
}

/// A single relation atom: package name, optional architecture qualifier,
/// optional version constraint.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub architecture: Option<String>,
    pub constraint: Option<(VersionConstraint, PackageVersion)>,
}

impl Dependency {
    /// Parse a single atom like `libssl3 (>= 3.0.0)` or `python3:any`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        let (head, constraint) = match s.split_once('(') {
            Some((head, rest)) => {
                let inner = rest.trim_end().strip_suffix(')').ok_or_else(|| {
                    BuildError::DependencyParse(format!("unterminated version constraint: {}", s))
                })?;

                let op_len = inner
                    .trim_start()
                    .find(|c: char| !matches!(c, '<' | '>' | '='))
                    .ok_or_else(|| {
                        BuildError::DependencyParse(format!("constraint missing version: {}", s))
                    })?;

                let inner = inner.trim_start();
                let (op, version) = inner.split_at(op_len);
                let constraint = VersionConstraint::parse(op)?;
                let version = PackageVersion::parse(version.trim())?;

                (head.trim(), Some((constraint, version)))
            }
            None => (s, None),
        };

        // Architecture restriction lists (`[amd64]`) only appear in source
        // package relations and carry no meaning here; strip them.
        let head = match head.split_once('[') {
            Some((head, _)) => head.trim(),
            None => head,
        };

        let (name, architecture) = match head.split_once(':') {
            Some((name, arch)) => (name, Some(arch.trim().to_string())),
            None => (head, None),
        };

        if name.is_empty() {
            return Err(BuildError::DependencyParse(format!(
                "relation missing package name: {}",
                s
            )));
        }

        Ok(Self {
            name: name.to_string(),
            architecture,
            constraint,
        })
    }

    /// Whether a concrete `(name, version)` satisfies this atom.
    pub fn satisfied_by(&self, name: &str, version: &PackageVersion) -> bool {
        if self.name != name {
            return false;
        }

        match &self.constraint {
            Some((op, wanted)) => op.satisfied_by(version, wanted),
            None => true,
        }
    }

    /// Whether a virtual package name satisfies this atom.
    ///
    /// Versioned relations are never satisfied by an unversioned `Provides`.
    pub fn satisfied_by_virtual(&self, provided: &str) -> bool {
        self.name == provided && self.constraint.is_none()
    }
}

impl Display for Dependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;

        if let Some(arch) = &self.architecture {
            write!(f, ":{}", arch)?;
        }

        if let Some((op, version)) = &self.constraint {
            write!(f, " ({} {})", op, version)?;
        }

        Ok(())
    }
}

/// A disjunction of atoms: `default-mta | mail-transport-agent`.
///
/// The relation is satisfied when any alternative is.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Alternatives {
    alternatives: Vec<Dependency>,
}

impl Alternatives {
    /// A relation with a single alternative.
    pub fn single(dependency: Dependency) -> Self {
        Self {
            alternatives: vec![dependency],
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let alternatives = s
            .split('|')
            .map(Dependency::parse)
            .collect::<Result<Vec<_>>>()?;

        if alternatives.is_empty() {
            return Err(BuildError::DependencyParse(format!(
                "empty relation: {}",
                s
            )));
        }

        Ok(Self { alternatives })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.alternatives.iter()
    }

    /// The first (preferred) alternative.
    pub fn preferred(&self) -> &Dependency {
        &self.alternatives[0]
    }
}

impl Display for Alternatives {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .alternatives
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>();

        f.write_str(&parts.join(" | "))
    }
}

/// A comma-separated list of relations, as found in `Depends` et al.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DependencyList {
    relations: Vec<Alternatives>,
}

impl DependencyList {
    pub fn parse(s: &str) -> Result<Self> {
        let relations = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Alternatives::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { relations })
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alternatives> {
        self.relations.iter()
    }

    /// Iterate over every atom in every relation.
    pub fn iter_atoms(&self) -> impl Iterator<Item = &Dependency> {
        self.relations.iter().flat_map(|r| r.iter())
    }
}

impl Display for DependencyList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .relations
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>();

        f.write_str(&parts.join(", "))
    }
}
