// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The package model of the universe.

A [Package] is a parsed `Packages` index stanza together with the set of
fully qualified URLs it can be fetched from. The original paragraph is
retained verbatim so stanzas can later be rewritten into the dpkg `status`
file without loss.
*/

use {
    crate::{
        control::Paragraph,
        dependency::DependencyList,
        error::{BuildError, Result},
        version::PackageVersion,
    },
    std::fmt::{Display, Formatter},
    url::Url,
};

/// Debian package priority.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    Required,
    Important,
    Standard,
    #[default]
    Optional,
    Extra,
}

impl Priority {
    pub fn parse(s: &str) -> Self {
        match s {
            "required" => Self::Required,
            "important" => Self::Important,
            "standard" => Self::Standard,
            "extra" => Self::Extra,
            _ => Self::Optional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Important => "important",
            Self::Standard => "standard",
            Self::Optional => "optional",
            Self::Extra => "extra",
        }
    }
}

/// A single entry in a `Provides` field.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Provided {
    pub name: String,
    pub version: Option<PackageVersion>,
}

/// A binary package from a repository index.
#[derive(Clone, Debug)]
pub struct Package {
    paragraph: Paragraph,

    name: String,
    version: PackageVersion,
    architecture: String,
    priority: Priority,
    essential: bool,

    depends: DependencyList,
    pre_depends: DependencyList,
    recommends: DependencyList,
    suggests: DependencyList,
    conflicts: DependencyList,
    breaks: DependencyList,
    replaces: DependencyList,
    provides: Vec<Provided>,

    sha256: String,
    size: u64,
    filename: String,

    /// Fully qualified download URLs, one per mirror.
    urls: Vec<Url>,
}

impl Package {
    /// Construct an instance from a `Packages` stanza.
    ///
    /// `base_urls` are the repository base plus any mirrors; the stanza's
    /// relative `Filename` is resolved against each of them. Every package
    /// must carry at least one URL and a SHA-256 digest.
    pub fn from_paragraph(paragraph: Paragraph, base_urls: &[Url]) -> Result<Self> {
        let name = paragraph
            .field_str("Package")
            .ok_or(BuildError::PackageRequiredFieldMissing("Package"))?
            .to_string();

        let version = PackageVersion::parse(
            paragraph
                .field_str("Version")
                .ok_or(BuildError::PackageRequiredFieldMissing("Version"))?,
        )?;

        let architecture = paragraph
            .field_str("Architecture")
            .ok_or(BuildError::PackageRequiredFieldMissing("Architecture"))?
            .to_string();

        let sha256 = paragraph
            .field_str("SHA256")
            .map(str::to_string)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BuildError::PackageNoDigest(name.clone()))?;

        let size = paragraph
            .field_u64("Size")
            .ok_or(BuildError::PackageRequiredFieldMissing("Size"))??;

        let filename = paragraph
            .field_str("Filename")
            .ok_or(BuildError::PackageRequiredFieldMissing("Filename"))?
            .to_string();

        let urls = base_urls
            .iter()
            .map(|base| base.join(filename.trim_start_matches('/')))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if urls.is_empty() {
            return Err(BuildError::PackageNoUrl(name));
        }

        let field_relations = |field: &str| -> Result<DependencyList> {
            match paragraph.field_str(field) {
                Some(value) => DependencyList::parse(value),
                None => Ok(DependencyList::default()),
            }
        };

        let provides = match paragraph.field_str("Provides") {
            Some(value) => DependencyList::parse(value)?
                .iter_atoms()
                .map(|atom| Provided {
                    name: atom.name.clone(),
                    version: atom.constraint.as_ref().map(|(_, v)| v.clone()),
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            name,
            version,
            architecture,
            priority: paragraph
                .field_str("Priority")
                .map(Priority::parse)
                .unwrap_or_default(),
            essential: paragraph.field_bool("Essential"),
            depends: field_relations("Depends")?,
            pre_depends: field_relations("Pre-Depends")?,
            recommends: field_relations("Recommends")?,
            suggests: field_relations("Suggests")?,
            conflicts: field_relations("Conflicts")?,
            breaks: field_relations("Breaks")?,
            replaces: field_relations("Replaces")?,
            provides,
            sha256,
            size,
            filename,
            urls,
            paragraph,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &PackageVersion {
        &self.version
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_essential(&self) -> bool {
        self.essential
    }

    pub fn depends(&self) -> &DependencyList {
        &self.depends
    }

    pub fn pre_depends(&self) -> &DependencyList {
        &self.pre_depends
    }

    pub fn recommends(&self) -> &DependencyList {
        &self.recommends
    }

    pub fn suggests(&self) -> &DependencyList {
        &self.suggests
    }

    pub fn conflicts(&self) -> &DependencyList {
        &self.conflicts
    }

    pub fn breaks(&self) -> &DependencyList {
        &self.breaks
    }

    pub fn replaces(&self) -> &DependencyList {
        &self.replaces
    }

    pub fn provides(&self) -> &[Provided] {
        &self.provides
    }

    /// Hex SHA-256 digest of the `.deb` archive.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Size of the `.deb` archive in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The repository-relative `Filename`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The archive basename, e.g. `dash_0.5.12-2_amd64.deb`.
    pub fn archive_basename(&self) -> &str {
        self.filename
            .rsplit_once('/')
            .map(|(_, base)| base)
            .unwrap_or(&self.filename)
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Merge another instance of the same `(name, arch, version)`.
    ///
    /// Digests must agree; URL lists are unioned.
    pub fn merge_urls(&mut self, other: &Package) -> Result<()> {
        if self.sha256 != other.sha256 {
            return Err(BuildError::PackageDigestConflict(self.to_string()));
        }

        for url in &other.urls {
            if !self.urls.contains(url) {
                self.urls.push(url.clone());
            }
        }

        Ok(())
    }

    /// The original index stanza.
    pub fn paragraph(&self) -> &Paragraph {
        &self.paragraph
    }
}

impl Display for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.name, self.version, self.architecture)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::control::ParagraphReader;

    /// Build a package from inline stanza text, for resolver and database
    /// tests.
    pub(crate) fn package(stanza: &str) -> Package {
        let paragraph = ParagraphReader::new(stanza.as_bytes())
            .next()
            .expect("stanza present")
            .expect("stanza parses");

        let base = Url::parse("http://deb.example.org/debian/").unwrap();

        Package::from_paragraph(paragraph, &[base]).expect("package builds")
    }

    pub(crate) fn stanza(name: &str, version: &str, extra: &str) -> String {
        format!(
            "Package: {name}\nVersion: {version}\nArchitecture: amd64\nSize: 1234\nFilename: pool/main/{c}/{name}/{name}_{version}_amd64.deb\nSHA256: {digest}\n{extra}",
            name = name,
            version = version,
            c = &name[0..1],
            digest = "a".repeat(64),
            extra = extra,
        )
    }
}
