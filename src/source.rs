// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Apt-style repository sources.

A [Source] is one configured repository: a base URL, suites, components,
and the PGP keys its release files must verify against. Expanding a source
yields one [Component] per `(suite, component, architecture)` triple; each
component can then fetch and parse its `Packages` index into [Package]s.
*/

use {
    crate::{
        client::CachingClient,
        control::ParagraphReader,
        error::{BuildError, Result},
        io::{read_decompressed, ContentDigest},
        package::Package,
        release::ReleaseFile,
    },
    chrono::{DateTime, Utc},
    futures::AsyncReadExt,
    pgp::{
        composed::{Deserializable, SignedPublicKey, StandaloneSignature},
    },
    tracing::{debug, info},
    url::Url,
};

/// Configuration for one repository source, from the recipe.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    /// Repository base URL, e.g. `http://deb.debian.org/debian`.
    pub uri: String,

    /// Suites to index, e.g. `bookworm`.
    pub suites: Vec<String>,

    /// Components to index, e.g. `main`.
    pub components: Vec<String>,

    /// Armored PGP public keys (inline) or `http(s)` URLs to fetch them
    /// from. Must not be empty.
    #[serde(default)]
    pub signed_by: Vec<String>,

    /// Additional mirror base URLs carrying the same pool.
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// A verified `(suite, component, architecture)` slice of a source.
pub struct Component {
    client: CachingClient,

    /// Pool base URLs: the source URI plus mirrors.
    base_urls: Vec<Url>,

    /// `{base}/dists/{suite}/` for index fetches.
    suite_url: Url,

    pub suite: String,
    pub component: String,
    pub architecture: String,

    index: crate::release::PackagesIndex,
    acquire_by_hash: bool,

    /// The release file's `Date:` field.
    pub last_updated: DateTime<Utc>,
}

/// One configured repository with its trusted keys loaded.
pub struct Source {
    client: CachingClient,
    config: SourceConfig,
    base_urls: Vec<Url>,
    keys: Vec<SignedPublicKey>,
}

/// Ensure a URL ends with a trailing slash so joins stay inside it.
fn base_url(s: &str) -> Result<Url> {
    let mut url = Url::parse(s)?;

    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }

    Ok(url)
}

impl Source {
    /// Create a source, loading and parsing its trust anchors.
    ///
    /// Fails with `TrustUnconfigured` when `signedBy` is empty, before any
    /// repository I/O happens.
    pub async fn new(client: CachingClient, config: SourceConfig) -> Result<Self> {
        if config.signed_by.is_empty() {
            return Err(BuildError::TrustUnconfigured(config.uri.clone()));
        }

        let mut base_urls = vec![base_url(&config.uri)?];
        for mirror in &config.mirrors {
            base_urls.push(base_url(mirror)?);
        }

        let mut keys = Vec::new();

        for entry in &config.signed_by {
            let armored = if entry.trim_start().starts_with("-----BEGIN") {
                entry.clone()
            } else {
                let url = Url::parse(entry)?;
                String::from_utf8(client.get(&url).await?).map_err(|_| {
                    BuildError::SignatureInvalid(format!("key at {} is not ASCII armor", entry))
                })?
            };

            let (key, _) = SignedPublicKey::from_string(&armored)?;
            keys.push(key);
        }

        Ok(Self {
            client,
            config,
            base_urls,
            keys,
        })
    }

    /// Fetch and verify the release file for a suite.
    ///
    /// `InRelease` (inline signature) is preferred; `Release` plus a
    /// detached `Release.gpg` is the fallback.
    async fn fetch_release(&self, suite: &str) -> Result<ReleaseFile> {
        let suite_url = self.base_urls[0].join(&format!("dists/{}/", suite))?;

        let release = match self.client.get(&suite_url.join("InRelease")?).await {
            Ok(data) => {
                let release = ReleaseFile::from_armored_reader(std::io::Cursor::new(data))?;

                let signatures = release.signatures().ok_or_else(|| {
                    BuildError::SignatureInvalid(format!("{}: InRelease has no signature", suite))
                })?;

                if !self
                    .keys
                    .iter()
                    .any(|key| matches!(signatures.verify(key), Ok(n) if n > 0))
                {
                    return Err(BuildError::SignatureInvalid(format!(
                        "{}: InRelease signature matches no configured key",
                        suite_url
                    )));
                }

                release
            }
            Err(e) => {
                debug!(suite = %suite, error = %e, "InRelease unavailable; trying Release + Release.gpg");

                let data = self.client.get(&suite_url.join("Release")?).await?;
                let sig_data = self.client.get(&suite_url.join("Release.gpg")?).await?;

                let armored = String::from_utf8(sig_data).map_err(|_| {
                    BuildError::SignatureInvalid(format!("{}: Release.gpg is not ASCII armor", suite))
                })?;
                let (signature, _) = StandaloneSignature::from_string(&armored)?;

                if !self
                    .keys
                    .iter()
                    .any(|key| signature.verify(key, &data).is_ok())
                {
                    return Err(BuildError::SignatureInvalid(format!(
                        "{}: Release.gpg signature matches no configured key",
                        suite_url
                    )));
                }

                ReleaseFile::from_reader(std::io::Cursor::new(data))?
            }
        };

        if let Some(valid_until) = release.valid_until() {
            let valid_until = valid_until?;
            if Utc::now() > valid_until {
                return Err(BuildError::ReleaseExpired(
                    suite.to_string(),
                    valid_until.to_rfc2822(),
                ));
            }
        }

        Ok(release)
    }

    /// Expand this source into components for a target architecture.
    ///
    /// Suites are fetched sequentially; callers parallelize across
    /// sources.
    pub async fn components(&self, architecture: &str) -> Result<Vec<Component>> {
        let mut out = Vec::new();

        for suite in &self.config.suites {
            let release = self.fetch_release(suite).await?;

            let last_updated = release
                .date()
                .transpose()?
                .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch"));

            let suite_url = self.base_urls[0].join(&format!("dists/{}/", suite))?;

            for (component, arch) in
                select_components(&release, suite, &self.config.components, architecture)?
            {
                let index = release.packages_index(&component, &arch)?;

                info!(
                    suite = %suite,
                    component = %component,
                    architecture = %arch,
                    "indexed repository component"
                );

                out.push(Component {
                    client: self.client.clone(),
                    base_urls: self.base_urls.clone(),
                    suite_url: suite_url.clone(),
                    suite: suite.clone(),
                    component,
                    architecture: arch,
                    index,
                    acquire_by_hash: release.acquire_by_hash(),
                    last_updated,
                });
            }
        }

        Ok(out)
    }
}

/// Intersect requested components/architectures with what the release
/// publishes. The `all` architecture rides along with the target when
/// published.
fn select_components(
    release: &ReleaseFile,
    suite: &str,
    requested: &[String],
    architecture: &str,
) -> Result<Vec<(String, String)>> {
    let published_components = release.components();
    let published_archs = release.architectures();

    let mut out = Vec::new();

    for component in requested {
        if !published_components.contains(&component.as_str()) {
            return Err(BuildError::ComponentMissing(
                component.clone(),
                suite.to_string(),
            ));
        }

        for arch in [architecture, "all"] {
            if published_archs.contains(&arch) {
                out.push((component.clone(), arch.to_string()));
            }
        }
    }

    Ok(out)
}

impl Component {
    /// Fetch, verify, decompress, and parse this component's `Packages`
    /// index.
    pub async fn packages(&self) -> Result<Vec<Package>> {
        let path = if self.acquire_by_hash {
            ReleaseFile::by_hash_path(&self.index.entry)
        } else {
            self.index.entry.path.clone()
        };

        let url = self.suite_url.join(&path)?;
        let data = self.client.get(&url).await?;

        if data.len() as u64 != self.index.entry.size {
            return Err(BuildError::SizeMismatch {
                url: url.to_string(),
                expected: self.index.entry.size,
                actual: data.len() as u64,
            });
        }

        let actual = ContentDigest::digest(&data);
        let expected = self.index.entry.content_digest()?;
        if actual != expected {
            return Err(BuildError::HashMismatch {
                url: url.to_string(),
                expected: expected.as_hex(),
                actual: actual.as_hex(),
            });
        }

        let mut reader = read_decompressed(
            Box::pin(futures::io::Cursor::new(data)),
            self.index.compression,
        );

        let mut decompressed = Vec::new();
        reader.read_to_end(&mut decompressed).await?;

        let mut packages = Vec::new();

        for paragraph in ParagraphReader::new(std::io::Cursor::new(decompressed)) {
            packages.push(Package::from_paragraph(paragraph?, &self.base_urls)?);
        }

        debug!(
            suite = %self.suite,
            component = %self.component,
            architecture = %self.architecture,
            count = packages.len(),
            "parsed packages index"
        );

        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = "\
Suite: bookworm
Date: Sat, 10 Feb 2024 11:07:25 UTC
Architectures: all amd64
Components: main contrib
SHA256:
 3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63      100 main/binary-amd64/Packages
";

    #[test]
    fn component_intersection() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        let selected =
            select_components(&release, "bookworm", &["main".to_string()], "amd64")?;

        assert_eq!(
            selected,
            vec![
                ("main".to_string(), "amd64".to_string()),
                ("main".to_string(), "all".to_string()),
            ]
        );

        Ok(())
    }

    #[test]
    fn unpublished_architecture_skipped() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        let selected =
            select_components(&release, "bookworm", &["main".to_string()], "arm64")?;

        // Only the `all` slice remains.
        assert_eq!(selected, vec![("main".to_string(), "all".to_string())]);

        Ok(())
    }

    #[test]
    fn missing_component_is_fatal() -> Result<()> {
        let release = ReleaseFile::from_reader(RELEASE.as_bytes())?;

        assert!(matches!(
            select_components(&release, "bookworm", &["non-free".to_string()], "amd64"),
            Err(BuildError::ComponentMissing(_, _))
        ));

        Ok(())
    }

    #[test]
    fn base_url_gets_trailing_slash() -> Result<()> {
        assert_eq!(
            base_url("http://deb.debian.org/debian")?.as_str(),
            "http://deb.debian.org/debian/"
        );
        assert_eq!(
            base_url("http://deb.debian.org/debian/")?.as_str(),
            "http://deb.debian.org/debian/"
        );

        Ok(())
    }

    #[tokio::test]
    async fn empty_signed_by_is_trust_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            CachingClient::new(crate::cache::DiskCache::new(dir.path()).unwrap()).unwrap();

        let config = SourceConfig {
            uri: "http://deb.debian.org/debian".to_string(),
            suites: vec!["bookworm".to_string()],
            components: vec!["main".to_string()],
            signed_by: vec![],
            mirrors: vec![],
        };

        assert!(matches!(
            Source::new(client, config).await,
            Err(BuildError::TrustUnconfigured(_))
        ));
    }
}
