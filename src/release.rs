// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file primitives.

A `Release` (or inline-signed `InRelease`) file is the signed manifest of a
suite: repository metadata plus digests for every index file. See
<https://wiki.debian.org/DebianRepository/Format>.
*/

use {
    crate::{
        control::{Paragraph, ParagraphReader},
        error::{BuildError, Result},
        io::{Compression, ContentDigest},
    },
    chrono::{DateTime, Utc},
    mailparse::dateparse,
    pgp_cleartext::{CleartextSignatureReader, CleartextSignatures},
    std::io::{BufRead, Read},
};

/// One file listed in the `SHA256` field of a release file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Path relative to the suite directory.
    pub path: String,

    /// Hex SHA-256 digest.
    pub digest: String,

    /// Size in bytes.
    pub size: u64,
}

impl IndexEntry {
    pub fn content_digest(&self) -> Result<ContentDigest> {
        ContentDigest::from_hex(&self.digest)
    }
}

/// A reference to a concrete `Packages` index to fetch.
#[derive(Clone, Debug)]
pub struct PackagesIndex {
    pub entry: IndexEntry,
    pub compression: Compression,
}

/// A parsed `[In]Release` file.
///
/// Wraps the single control paragraph; inline signatures, when present,
/// ride along for later verification.
pub struct ReleaseFile {
    paragraph: Paragraph,
    signatures: Option<CleartextSignatures>,
}

impl ReleaseFile {
    /// Parse from a plain (non-armored) control file with exactly one
    /// paragraph.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let paragraphs = ParagraphReader::new(reader).collect::<Result<Vec<_>>>()?;

        if paragraphs.len() != 1 {
            return Err(BuildError::ReleaseParagraphMismatch(paragraphs.len()));
        }

        Ok(Self {
            paragraph: paragraphs.into_iter().next().expect("length checked"),
            signatures: None,
        })
    }

    /// Parse from a PGP cleartext-armored `InRelease` stream.
    ///
    /// The signature is captured but NOT verified here; call
    /// [Self::signatures] to verify against trusted keys.
    pub fn from_armored_reader<R: Read + BufRead>(reader: R) -> Result<Self> {
        let reader = CleartextSignatureReader::new(reader);
        let mut reader = std::io::BufReader::new(reader);

        let mut slf = Self::from_reader(&mut reader)?;
        slf.signatures = Some(reader.into_inner().finalize());

        Ok(slf)
    }

    /// Inline signatures, present when parsed from an `InRelease` file.
    pub fn signatures(&self) -> Option<&CleartextSignatures> {
        self.signatures.as_ref()
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.paragraph.field_str(name)
    }

    pub fn suite(&self) -> Option<&str> {
        self.field_str("Suite")
    }

    pub fn codename(&self) -> Option<&str> {
        self.field_str("Codename")
    }

    /// Component names published by this suite.
    pub fn components(&self) -> Vec<&str> {
        self.paragraph
            .field_words("Components")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Architectures published by this suite.
    pub fn architectures(&self) -> Vec<&str> {
        self.paragraph
            .field_words("Architectures")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// The `Date:` field as a UTC timestamp.
    pub fn date(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_str("Date").map(|v| {
            let epoch = dateparse(v)?;
            DateTime::from_timestamp(epoch, 0)
                .ok_or_else(|| BuildError::ControlParse(format!("date out of range: {}", v)))
        })
    }

    /// The `Valid-Until:` field as a UTC timestamp.
    pub fn valid_until(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_str("Valid-Until").map(|v| {
            let epoch = dateparse(v)?;
            DateTime::from_timestamp(epoch, 0)
                .ok_or_else(|| BuildError::ControlParse(format!("date out of range: {}", v)))
        })
    }

    /// Whether index files should be fetched through `by-hash` paths.
    pub fn acquire_by_hash(&self) -> bool {
        self.paragraph.field_bool("Acquire-By-Hash")
    }

    /// Entries of the `SHA256` index list.
    pub fn sha256_entries(&self) -> Result<Vec<IndexEntry>> {
        let lines = match self.paragraph.field_lines("SHA256") {
            Some(lines) => lines,
            None => return Ok(Vec::new()),
        };

        lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                // <digest> <size> <path>
                let mut parts = line.split_ascii_whitespace();

                let digest = parts.next();
                let size = parts.next();
                let path = parts.next();

                match (digest, size, path, parts.next()) {
                    (Some(digest), Some(size), Some(path), None) => Ok(IndexEntry {
                        path: path.to_string(),
                        digest: digest.to_string(),
                        size: size.parse()?,
                    }),
                    _ => Err(BuildError::ReleaseIndexEntryMalformed(line.to_string())),
                }
            })
            .collect()
    }

    /// Find the `Packages` index for `(component, architecture)`,
    /// preferring the most compressed variant listed.
    pub fn packages_index(&self, component: &str, architecture: &str) -> Result<PackagesIndex> {
        let entries = self.sha256_entries()?;

        for compression in Compression::preferred_order() {
            let wanted = format!(
                "{}/binary-{}/Packages{}",
                component,
                architecture,
                compression.extension()
            );

            if let Some(entry) = entries.iter().find(|e| e.path == wanted) {
                return Ok(PackagesIndex {
                    entry: entry.clone(),
                    compression,
                });
            }
        }

        Err(BuildError::PackagesIndexMissing(
            component.to_string(),
            architecture.to_string(),
        ))
    }

    /// The `by-hash` variant of an index path.
    pub fn by_hash_path(entry: &IndexEntry) -> String {
        match entry.path.rsplit_once('/') {
            Some((prefix, _)) => format!("{}/by-hash/SHA256/{}", prefix, entry.digest),
            None => format!("by-hash/SHA256/{}", entry.digest),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RELEASE: &str = "\
Origin: Debian
Label: Debian
Suite: stable
Codename: bookworm
Date: Sat, 10 Feb 2024 11:07:25 UTC
Valid-Until: Sat, 17 Feb 2024 11:07:25 UTC
Architectures: all amd64 arm64
Components: main contrib non-free
SHA256:
 3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63   738242 main/binary-amd64/Packages
 3e9a121d599b56c08bc8f144e4830807c77c29d7114316d6984ba54695d3db7b    57319 main/binary-amd64/Packages.gz
 706c840235798e098d4d6013d1dabbc967f894d0ffa02c92ac959dcea85ddf54    23912 main/binary-amd64/Packages.xz
 48cfe101cd84f16baf720b99e8f2ff89fd7e063553966d8536b472677acb82f0   103223 main/binary-all/Packages
";

    #[test]
    fn parse_metadata() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        assert_eq!(release.suite(), Some("stable"));
        assert_eq!(release.codename(), Some("bookworm"));
        assert_eq!(release.components(), vec!["main", "contrib", "non-free"]);
        assert_eq!(release.architectures(), vec!["all", "amd64", "arm64"]);

        let date = release.date().unwrap()?;
        assert_eq!(date.timestamp(), 1707563245);

        let valid_until = release.valid_until().unwrap()?;
        assert!(valid_until > date);

        Ok(())
    }

    #[test]
    fn index_entries() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        let entries = release.sha256_entries()?;
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            IndexEntry {
                path: "main/binary-amd64/Packages".to_string(),
                digest: "3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63"
                    .to_string(),
                size: 738242,
            }
        );

        assert_eq!(
            ReleaseFile::by_hash_path(&entries[0]),
            "main/binary-amd64/by-hash/SHA256/3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63"
        );

        Ok(())
    }

    #[test]
    fn packages_index_prefers_compression() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        let index = release.packages_index("main", "amd64")?;
        assert_eq!(index.compression, Compression::Xz);
        assert_eq!(index.entry.path, "main/binary-amd64/Packages.xz");

        // Only the uncompressed variant is listed for binary-all.
        let index = release.packages_index("main", "all")?;
        assert_eq!(index.compression, Compression::None);

        Ok(())
    }

    #[test]
    fn missing_packages_index() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        assert!(matches!(
            release.packages_index("contrib", "amd64"),
            Err(BuildError::PackagesIndexMissing(_, _))
        ));

        Ok(())
    }

    #[test]
    fn multiple_paragraphs_rejected() {
        let input = "Suite: a\n\nSuite: b\n";
        assert!(matches!(
            ReleaseFile::from_reader(input.as_bytes()),
            Err(BuildError::ReleaseParagraphMismatch(2))
        ));
    }
}
