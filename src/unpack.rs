// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `.deb` extraction and dpkg database synthesis.

A `.deb` is an `ar(5)` archive holding `debian-binary`, `control.tar.*`,
and `data.tar.*`. For every package this module re-serializes the data
member into a canonical uncompressed tar (entry metadata clamped to the
source date epoch) and collects control metadata. Once all packages are
processed a single dpkg database archive is synthesized containing
`/var/lib/dpkg/{status,available,info/,triggers/}` with fully
deterministic ordering.
*/

use {
    crate::{
        control::{Paragraph, ParagraphReader},
        error::{BuildError, Result},
        io::{append_tar_entry, decompress_buffer, Compression},
        progress::Progress,
    },
    futures::StreamExt,
    std::{
        collections::BTreeMap,
        io::{Read, Write},
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Maintainer scripts installed mode 0755 under `/var/lib/dpkg/info/`.
const MAINTAINER_SCRIPTS: &[&str] = &["preinst", "postinst", "prerm", "postrm"];

/// Control-member files copied verbatim under `/var/lib/dpkg/info/`.
const INFO_FILES: &[&str] = &["md5sums", "conffiles", "shlibs", "triggers"];

/// One unpacked package.
#[derive(Clone, Debug)]
pub struct UnpackedPackage {
    pub name: String,

    /// Canonical uncompressed data tar at `scratch/<name>.data.tar`.
    pub data_archive: PathBuf,

    /// Stanza for the dpkg `status` file, trailing newline included.
    status_stanza: String,

    /// `(basename, content, mode)` entries for `/var/lib/dpkg/info/`.
    info_files: Vec<(String, Vec<u8>, u32)>,
}

/// Result of unpacking a package set.
#[derive(Clone, Debug)]
pub struct UnpackResult {
    /// Synthesized dpkg database archive (`dpkg-db.tar`).
    pub dpkg_database_archive: PathBuf,

    /// Unpacked packages, sorted by name.
    pub packages: Vec<UnpackedPackage>,
}

impl UnpackResult {
    /// Data archive paths in the given (resolver) order.
    ///
    /// Unknown names are skipped; the resolver's selection and the
    /// downloaded set are identical in a correct pipeline.
    pub fn data_archives_in_order(&self, order: &[String]) -> Vec<PathBuf> {
        let by_name: BTreeMap<&str, &UnpackedPackage> = self
            .packages
            .iter()
            .map(|p| (p.name.as_str(), p))
            .collect();

        order
            .iter()
            .filter_map(|name| by_name.get(name.as_str()))
            .map(|p| p.data_archive.clone())
            .collect()
    }
}

/// The members of one `.deb` archive, decompressed.
struct DebMembers {
    control_tar: Vec<u8>,
    data_tar: Vec<u8>,
}

fn read_deb_members(path: &Path) -> Result<DebMembers> {
    let mut archive = ar::Archive::new(std::fs::File::open(path)?);

    let mut control_tar = None;
    let mut data_tar = None;

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;
        let identifier = String::from_utf8_lossy(entry.header().identifier()).to_string();

        if identifier == "debian-binary" {
            continue;
        } else if identifier.starts_with("control.tar") {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            control_tar = Some(decompress_buffer(
                &data,
                Compression::from_member_name(&identifier)?,
            )?);
        } else if identifier.starts_with("data.tar") {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            data_tar = Some(decompress_buffer(
                &data,
                Compression::from_member_name(&identifier)?,
            )?);
        } else {
            return Err(BuildError::DebUnknownMember(identifier));
        }
    }

    Ok(DebMembers {
        control_tar: control_tar.ok_or(BuildError::DebMissingMember("control.tar"))?,
        data_tar: data_tar.ok_or(BuildError::DebMissingMember("data.tar"))?,
    })
}

/// Extract the control member into `basename -> content`.
fn control_files(control_tar: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(control_tar));
    let mut out = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        out.insert(name, content);
    }

    Ok(out)
}

/// Re-serialize a data tar into canonical form.
///
/// Entry order and `./`-prefixed names are preserved; mtimes above the
/// epoch are clamped down to it; uid/gid pass through unchanged.
fn write_canonical_data_tar(data_tar: &[u8], dest: &Path, epoch: u64) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(data_tar));
    let mut builder = tar::Builder::new(std::io::BufWriter::new(std::fs::File::create(dest)?));

    for entry in archive.entries()? {
        let mut entry = entry?;

        let mut header = entry.header().clone();
        if header.mtime()? > epoch {
            header.set_mtime(epoch);
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();

        match entry.header().entry_type() {
            tar::EntryType::Link | tar::EntryType::Symlink => {
                let target = entry.link_name()?.ok_or_else(|| {
                    BuildError::ControlParse(format!("link entry without target: {}", name))
                })?;
                header.set_link_name(&target)?;
                append_tar_entry(&mut builder, &mut header, &name, std::io::empty())?;
            }
            _ => {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                header.set_size(content.len() as u64);
                append_tar_entry(&mut builder, &mut header, &name, content.as_slice())?;
            }
        }
    }

    builder.into_inner()?.flush()?;

    Ok(())
}

/// Unpack one `.deb` into its canonical artifacts.
fn unpack_one(deb_path: &Path, scratch: &Path, epoch: u64) -> Result<UnpackedPackage> {
    let members = read_deb_members(deb_path)?;
    let mut files = control_files(&members.control_tar)?;

    let control = files.remove("control").ok_or(BuildError::DebMissingMember("control"))?;

    let mut paragraph: Paragraph = ParagraphReader::new(std::io::Cursor::new(&control))
        .next()
        .ok_or(BuildError::DebMissingMember("control"))??;

    let name = paragraph
        .field_str("Package")
        .ok_or(BuildError::PackageRequiredFieldMissing("Package"))?
        .to_string();

    // The second stage promotes `unpacked` to `installed` after
    // `dpkg --configure`.
    paragraph.insert_after("Package", "Status", "install ok unpacked");
    let status_stanza = paragraph.to_string();

    let mut info_files = Vec::new();

    for script in MAINTAINER_SCRIPTS {
        if let Some(content) = files.remove(*script) {
            info_files.push((format!("{}.{}", name, script), content, 0o755));
        }
    }

    for file in INFO_FILES {
        if let Some(content) = files.remove(*file) {
            info_files.push((format!("{}.{}", name, file), content, 0o644));
        }
    }

    let data_archive = scratch.join(format!("{}.data.tar", name));
    write_canonical_data_tar(&members.data_tar, &data_archive, epoch)?;

    debug!(package = %name, archive = %data_archive.display(), "unpacked package");

    Ok(UnpackedPackage {
        name,
        data_archive,
        status_stanza,
        info_files,
    })
}

fn new_db_header(epoch: u64, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(epoch);
    header.set_mode(mode);
    header.set_size(size);
    header
}

/// Write the merged dpkg database archive.
///
/// Contains `/var/lib/dpkg/{status,available,info/,triggers/}`. Entries
/// are emitted in sorted path order with clamped metadata, so identical
/// inputs produce identical bytes.
fn write_dpkg_database(packages: &[UnpackedPackage], dest: &Path, epoch: u64) -> Result<()> {
    let mut builder = tar::Builder::new(std::io::BufWriter::new(std::fs::File::create(dest)?));

    let dir = |builder: &mut tar::Builder<_>, path: &str| -> Result<()> {
        let mut header = new_db_header(epoch, 0o755, 0);
        header.set_entry_type(tar::EntryType::Directory);
        append_tar_entry(builder, &mut header, path, std::io::empty())?;
        Ok(())
    };

    let file =
        |builder: &mut tar::Builder<_>, path: &str, content: &[u8], mode: u32| -> Result<()> {
            let mut header = new_db_header(epoch, mode, content.len() as u64);
            append_tar_entry(builder, &mut header, path, content)?;
            Ok(())
        };

    dir(&mut builder, "./")?;
    dir(&mut builder, "./var/")?;
    dir(&mut builder, "./var/lib/")?;
    dir(&mut builder, "./var/lib/dpkg/")?;

    file(&mut builder, "./var/lib/dpkg/available", b"", 0o644)?;

    dir(&mut builder, "./var/lib/dpkg/info/")?;

    let mut info_entries = packages
        .iter()
        .flat_map(|pkg| pkg.info_files.iter())
        .collect::<Vec<_>>();
    info_entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (basename, content, mode) in info_entries {
        file(
            &mut builder,
            &format!("./var/lib/dpkg/info/{}", basename),
            content,
            *mode,
        )?;
    }

    let status = packages
        .iter()
        .map(|pkg| pkg.status_stanza.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    file(&mut builder, "./var/lib/dpkg/status", status.as_bytes(), 0o644)?;

    dir(&mut builder, "./var/lib/dpkg/triggers/")?;

    builder.into_inner()?.flush()?;

    Ok(())
}

/// Unpack every downloaded archive and synthesize the dpkg database.
///
/// Unpacks run on a bounded blocking pool sized to the host's parallelism
/// (capped at 16). The result is ordered by package name regardless of
/// completion order.
pub async fn unpack(
    scratch: &Path,
    deb_paths: &[PathBuf],
    epoch: u64,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> Result<UnpackResult> {
    let concurrency = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(16);

    let bar = progress.start("Unpacking", deb_paths.len() as u64);

    let scratch = Arc::new(scratch.to_path_buf());

    let tasks = deb_paths
        .iter()
        .map(|deb_path| {
            let deb_path = deb_path.clone();
            let scratch = Arc::clone(&scratch);
            let cancel = cancel.clone();

            async move {
                if cancel.is_cancelled() {
                    return Err(BuildError::Cancelled);
                }

                tokio::task::spawn_blocking(move || unpack_one(&deb_path, &scratch, epoch))
                    .await
                    .map_err(|e| {
                        BuildError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                    })?
            }
        })
        .collect::<Vec<_>>();

    let mut stream = futures::stream::iter(tasks).buffer_unordered(concurrency);

    let mut packages = Vec::with_capacity(deb_paths.len());

    while let Some(result) = stream.next().await {
        packages.push(result?);
        progress.tick(bar);
    }

    progress.finish(bar);

    packages.sort_by(|a, b| a.name.cmp(&b.name));

    let dpkg_database_archive = scratch.join("dpkg-db.tar");
    write_dpkg_database(&packages, &dpkg_database_archive, epoch)?;

    Ok(UnpackResult {
        dpkg_database_archive,
        packages,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::io::Write;

    /// Build a synthetic `.deb` in memory.
    pub(crate) fn make_deb(
        name: &str,
        data_files: &[(&str, &[u8], u64)],
        scripts: &[(&str, &str)],
        mtime: u64,
    ) -> Vec<u8> {
        let control = format!(
            "Package: {}\nVersion: 1.0-1\nArchitecture: amd64\nMaintainer: Test <test@example.org>\nDescription: test package\n",
            name
        );

        let control_tar = {
            let mut builder = tar::Builder::new(Vec::new());

            let mut add = |path: &str, content: &[u8], mode: u32| {
                let mut header = tar::Header::new_gnu();
                header.set_uid(0);
                header.set_gid(0);
                header.set_mtime(mtime);
                header.set_mode(mode);
                header.set_size(content.len() as u64);
                append_tar_entry(&mut builder, &mut header, path, content)
                    .expect("control entry");
            };

            add("./control", control.as_bytes(), 0o644);
            add(
                "./md5sums",
                b"d41d8cd98f00b204e9800998ecf8427e  usr/share/doc/test\n",
                0o644,
            );
            for (script, content) in scripts {
                add(&format!("./{}", script), content.as_bytes(), 0o755);
            }

            builder.into_inner().expect("control tar")
        };

        let data_tar = {
            let mut builder = tar::Builder::new(Vec::new());

            for (path, content, file_mtime) in data_files {
                let mut header = tar::Header::new_gnu();
                header.set_uid(0);
                header.set_gid(0);
                header.set_mtime(*file_mtime);
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
                append_tar_entry(&mut builder, &mut header, path, *content)
                    .expect("data entry");
            }

            builder.into_inner().expect("data tar")
        };

        let gzip = |data: &[u8]| {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).expect("gzip write");
            encoder.finish().expect("gzip finish")
        };

        let mut out = Vec::new();
        {
            let mut ar_builder = ar::Builder::new(&mut out);

            let append = |ar_builder: &mut ar::Builder<&mut Vec<u8>>,
                          name: &str,
                          data: &[u8]| {
                let mut header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(mtime);
                header.set_uid(0);
                header.set_gid(0);
                ar_builder.append(&header, data).expect("ar entry");
            };

            append(&mut ar_builder, "debian-binary", b"2.0\n");
            append(
                &mut ar_builder,
                "control.tar.gz",
                &gzip(&control_tar),
            );
            append(&mut ar_builder, "data.tar.gz", &gzip(&data_tar));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::{testutil::make_deb, *};
    use crate::progress::NoProgress;
    use sha2::{Digest, Sha256};

    const EPOCH: u64 = 1700000000;

    fn write_deb(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(format!("{}_1.0-1_amd64.deb", name));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn unpack_synthesizes_artifacts() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let deb = make_deb(
            "testpkg",
            &[("./usr/bin/tool", b"#!/bin/sh\n", EPOCH - 10)],
            &[("postinst", "#!/bin/sh\nexit 0\n")],
            EPOCH,
        );
        let deb_path = write_deb(dir.path(), "testpkg", &deb);

        let result = unpack(
            dir.path(),
            &[deb_path],
            EPOCH,
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(result.packages.len(), 1);
        let pkg = &result.packages[0];
        assert_eq!(pkg.name, "testpkg");
        assert!(pkg.data_archive.is_file());
        assert!(result.dpkg_database_archive.is_file());

        // Status stanza has Status right after Package.
        assert!(pkg
            .status_stanza
            .starts_with("Package: testpkg\nStatus: install ok unpacked\n"));

        Ok(())
    }

    #[test]
    fn data_tar_content_hash_preserved_and_mtime_clamped() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let content: &[u8] = b"important payload";
        // One file already old, one file from the future.
        let deb = make_deb(
            "payload",
            &[
                ("./usr/share/old", content, EPOCH - 1000),
                ("./usr/share/future", content, EPOCH + 1000),
            ],
            &[],
            EPOCH,
        );
        let deb_path = write_deb(dir.path(), "payload", &deb);

        let pkg = unpack_one(&deb_path, dir.path(), EPOCH)?;

        let mut archive = tar::Archive::new(std::fs::File::open(&pkg.data_archive)?);
        let mut seen = 0;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            let mtime = entry.header().mtime()?;

            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            assert_eq!(
                Sha256::digest(&data).as_slice(),
                Sha256::digest(content).as_slice(),
                "content hash preserved for {}",
                path
            );

            match path.as_str() {
                "./usr/share/old" => assert_eq!(mtime, EPOCH - 1000),
                "./usr/share/future" => assert_eq!(mtime, EPOCH),
                other => panic!("unexpected entry {}", other),
            }

            seen += 1;
        }

        assert_eq!(seen, 2);

        Ok(())
    }

    #[tokio::test]
    async fn dpkg_database_layout_and_determinism() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let deb_a = write_deb(
            dir.path(),
            "alpha",
            &make_deb("alpha", &[("./usr/share/a", b"a", EPOCH)], &[], EPOCH),
        );
        let deb_b = write_deb(
            dir.path(),
            "beta",
            &make_deb(
                "beta",
                &[("./usr/share/b", b"b", EPOCH)],
                &[("preinst", "#!/bin/sh\n")],
                EPOCH,
            ),
        );

        // Feed the archives in reverse name order; output must not care.
        let result = unpack(
            dir.path(),
            &[deb_b.clone(), deb_a.clone()],
            EPOCH,
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;

        let names = result
            .packages
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "beta"]);

        let first = std::fs::read(&result.dpkg_database_archive)?;

        let mut archive = tar::Archive::new(std::io::Cursor::new(&first));
        let paths = archive
            .entries()?
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            paths,
            vec![
                "./",
                "./var/",
                "./var/lib/",
                "./var/lib/dpkg/",
                "./var/lib/dpkg/available",
                "./var/lib/dpkg/info/",
                "./var/lib/dpkg/info/alpha.md5sums",
                "./var/lib/dpkg/info/beta.md5sums",
                "./var/lib/dpkg/info/beta.preinst",
                "./var/lib/dpkg/status",
                "./var/lib/dpkg/triggers/",
            ]
        );

        // Second run over the same inputs is byte-identical.
        let dir2 = tempfile::tempdir()?;
        let deb_a2 = write_deb(
            dir2.path(),
            "alpha",
            &make_deb("alpha", &[("./usr/share/a", b"a", EPOCH)], &[], EPOCH),
        );
        let deb_b2 = write_deb(
            dir2.path(),
            "beta",
            &make_deb(
                "beta",
                &[("./usr/share/b", b"b", EPOCH)],
                &[("preinst", "#!/bin/sh\n")],
                EPOCH,
            ),
        );

        let result2 = unpack(
            dir2.path(),
            &[deb_a2, deb_b2],
            EPOCH,
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(std::fs::read(&result2.dpkg_database_archive)?, first);

        Ok(())
    }

    #[tokio::test]
    async fn status_file_contains_sorted_stanzas() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let deb_b = write_deb(
            dir.path(),
            "beta",
            &make_deb("beta", &[("./b", b"b", EPOCH)], &[], EPOCH),
        );
        let deb_a = write_deb(
            dir.path(),
            "alpha",
            &make_deb("alpha", &[("./a", b"a", EPOCH)], &[], EPOCH),
        );

        let result = unpack(
            dir.path(),
            &[deb_b, deb_a],
            EPOCH,
            &NoProgress,
            &CancellationToken::new(),
        )
        .await?;

        let mut archive =
            tar::Archive::new(std::fs::File::open(&result.dpkg_database_archive)?);

        let mut status = String::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == "./var/lib/dpkg/status" {
                entry.read_to_string(&mut status)?;
            }
        }

        let alpha_pos = status.find("Package: alpha").unwrap();
        let beta_pos = status.find("Package: beta").unwrap();
        assert!(alpha_pos < beta_pos);
        assert!(status.contains("Status: install ok unpacked"));
        // Stanzas are blank-line separated.
        assert!(status.contains("\n\nPackage: beta"));

        Ok(())
    }

    #[test]
    fn missing_control_member_is_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let mut out = Vec::new();
        {
            let mut ar_builder = ar::Builder::new(&mut out);
            let header = ar::Header::new(b"debian-binary".to_vec(), 4);
            ar_builder.append(&header, &b"2.0\n"[..]).unwrap();
        }

        let path = dir.path().join("broken.deb");
        std::fs::write(&path, &out).unwrap();

        assert!(matches!(
            unpack_one(&path, dir.path(), EPOCH),
            Err(BuildError::DebMissingMember(_))
        ));
    }
}
