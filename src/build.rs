// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Image assembly.

Composes per-platform layer stacks (one layer per package data archive,
in resolver order, plus the dpkg database layer), runs the in-image
second stage against a staged rootfs, captures its effect as a final
delta layer, and writes the multi-platform OCI archive.

The backend is library-mode: the interface is a per-platform build plan
in, an OCI archive out. Second-stage execution goes through
[SecondStageRunner] so tests can substitute the chroot call.
*/

use {
    crate::{
        error::{BuildError, Result},
        io::append_tar_entry,
        oci::{
            ContainerConfig, History, ImageConfig, Index, Manifest, OciArchiveBuilder, Platform,
            RootFs, StagedLayer, ANNOTATION_REF_NAME, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX,
            MEDIA_TYPE_MANIFEST,
        },
    },
    chrono::{DateTime, SecondsFormat},
    std::{
        collections::BTreeMap,
        io::Write,
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::{Path, PathBuf},
        process::Command,
    },
    tracing::{debug, info, warn},
};

/// A parsed `os/arch[/variant]` target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlatformSpec {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl PlatformSpec {
    /// Parse a platform string such as `linux/amd64` or `linux/arm/v7`.
    ///
    /// Only `linux` images can be built.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');

        let (os, architecture) = match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => (os, arch),
            _ => return Err(BuildError::UnsupportedPlatform(s.to_string())),
        };

        if os != "linux" {
            return Err(BuildError::UnsupportedPlatform(s.to_string()));
        }

        Ok(Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: parts.next().map(str::to_string),
        })
    }

    /// The Debian architecture name for this platform.
    pub fn debian_architecture(&self) -> Result<String> {
        Ok(match (self.architecture.as_str(), self.variant.as_deref()) {
            ("amd64", _) => "amd64".to_string(),
            ("arm64", _) => "arm64".to_string(),
            ("arm", Some("v7")) | ("arm", None) => "armhf".to_string(),
            ("arm", Some("v5")) | ("arm", Some("v6")) => "armel".to_string(),
            ("386", _) => "i386".to_string(),
            ("ppc64le", _) => "ppc64el".to_string(),
            ("s390x", _) => "s390x".to_string(),
            ("riscv64", _) => "riscv64".to_string(),
            ("mips64le", _) => "mips64el".to_string(),
            _ => return Err(BuildError::UnsupportedPlatform(self.to_string())),
        })
    }

    /// A filesystem-safe name for per-platform scratch directories.
    pub fn scratch_name(&self) -> String {
        self.to_string().replace('/', "-")
    }

    fn oci_platform(&self) -> Platform {
        Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            variant: self.variant.clone(),
        }
    }
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Inputs for one platform's build.
#[derive(Clone, Debug)]
pub struct PlatformBuild {
    pub platform: PlatformSpec,

    /// Package data archives in resolver order.
    pub data_archives: Vec<PathBuf>,

    pub dpkg_database_archive: PathBuf,

    /// Names in `Pre-Depends`-respecting configure order.
    pub configure_order: Vec<String>,

    /// Per-platform scratch directory.
    pub scratch: PathBuf,
}

/// Inputs for a whole multi-platform build.
#[derive(Debug)]
pub struct BuildRequest {
    pub output: PathBuf,
    pub tags: Vec<String>,
    pub download_only: bool,
    pub source_date_epoch: u64,
    pub container: ContainerConfig,
    pub recipe_path: PathBuf,

    /// Binary copied into the image as `/usr/sbin/second-stage`.
    pub second_stage_binary: PathBuf,

    pub platforms: Vec<PlatformBuild>,
}

/// Executes the second stage inside a staged rootfs.
pub trait SecondStageRunner: Send + Sync {
    fn run(&self, rootfs: &Path, args: &[&str]) -> Result<()>;
}

/// Production runner: `chroot <rootfs> /usr/sbin/second-stage <args>`.
///
/// The staged binary is the full CLI, so the hidden `second-stage`
/// subcommand is inserted in front of the requested operation.
pub struct ChrootRunner;

impl SecondStageRunner for ChrootRunner {
    fn run(&self, rootfs: &Path, args: &[&str]) -> Result<()> {
        let status = Command::new("chroot")
            .arg(rootfs)
            .arg("/usr/sbin/second-stage")
            .arg("second-stage")
            .args(args)
            .status()
            .map_err(|e| BuildError::BackendStartFailure(format!("chroot: {}", e)))?;

        if !status.success() {
            return Err(BuildError::SecondStageFailure(format!(
                "second-stage {} exited with {}",
                args.join(" "),
                status
            )));
        }

        Ok(())
    }
}

/// Metadata snapshot of one filesystem entry, for delta detection.
#[derive(Clone, Debug, Eq, PartialEq)]
struct FileState {
    is_dir: bool,
    is_symlink: bool,
    size: u64,
    mtime: i64,
    mode: u32,
    link_target: Option<PathBuf>,
    digest: Option<Vec<u8>>,
}

fn file_state(path: &Path) -> Result<FileState> {
    let metadata = std::fs::symlink_metadata(path)?;
    let is_symlink = metadata.file_type().is_symlink();
    let is_dir = metadata.is_dir();

    let digest = if !is_dir && !is_symlink {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        std::io::copy(&mut std::fs::File::open(path)?, &mut hasher)?;
        Some(hasher.finalize().to_vec())
    } else {
        None
    };

    Ok(FileState {
        is_dir,
        is_symlink,
        size: metadata.len(),
        mtime: metadata.mtime(),
        mode: metadata.mode(),
        link_target: if is_symlink {
            Some(std::fs::read_link(path)?)
        } else {
            None
        },
        digest,
    })
}

/// Walk a tree into `relative path -> state`, in sorted order.
fn snapshot_tree(root: &Path) -> Result<BTreeMap<PathBuf, FileState>> {
    let mut out = BTreeMap::new();

    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            BuildError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walked path is under root")
            .to_path_buf();

        out.insert(relative, file_state(entry.path())?);
    }

    Ok(out)
}

/// Write the layer tar capturing everything that changed after the
/// second stage ran: added and modified entries, plus OCI whiteouts for
/// deletions. Returns false when nothing changed.
fn write_delta_layer(
    root: &Path,
    before: &BTreeMap<PathBuf, FileState>,
    dest: &Path,
    epoch: u64,
) -> Result<bool> {
    let after = snapshot_tree(root)?;

    let mut builder = tar::Builder::new(std::io::BufWriter::new(std::fs::File::create(dest)?));
    let mut wrote = false;

    for (relative, state) in &after {
        let unchanged = before.get(relative) == Some(state);

        // Directory metadata changes are uninteresting churn; only emit
        // directories that are new.
        if unchanged || (state.is_dir && before.contains_key(relative)) {
            continue;
        }

        wrote = true;

        let full = root.join(relative);
        let name = format!("./{}", relative.display());

        let mut header = tar::Header::new_gnu();
        let metadata = std::fs::symlink_metadata(&full)?;
        header.set_uid(metadata.uid() as u64);
        header.set_gid(metadata.gid() as u64);
        header.set_mode(metadata.mode() & 0o7777);
        header.set_mtime((state.mtime.max(0) as u64).min(epoch));

        if state.is_symlink {
            header.set_size(0);
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_link_name(state.link_target.as_ref().expect("symlink has target"))?;
            append_tar_entry(&mut builder, &mut header, &name, std::io::empty())?;
        } else if state.is_dir {
            header.set_size(0);
            header.set_entry_type(tar::EntryType::Directory);
            append_tar_entry(&mut builder, &mut header, &format!("{}/", name), std::io::empty())?;
        } else {
            header.set_size(state.size);
            append_tar_entry(&mut builder, &mut header, &name, std::fs::File::open(&full)?)?;
        }
    }

    for relative in before.keys() {
        if after.contains_key(relative) {
            continue;
        }

        // A parent directory whiteout covers its children.
        if relative
            .parent()
            .map(|parent| {
                parent != Path::new("") && !after.contains_key(parent)
            })
            .unwrap_or(false)
        {
            continue;
        }

        wrote = true;

        let whiteout = match relative.parent() {
            Some(parent) if parent != Path::new("") => parent.join(format!(
                ".wh.{}",
                relative.file_name().unwrap_or_default().to_string_lossy()
            )),
            _ => PathBuf::from(format!(
                ".wh.{}",
                relative.file_name().unwrap_or_default().to_string_lossy()
            )),
        };

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_mtime(epoch);
        header.set_size(0);
        append_tar_entry(
            &mut builder,
            &mut header,
            &format!("./{}", whiteout.display()),
            std::io::empty(),
        )?;
    }

    builder.into_inner()?.flush()?;

    Ok(wrote)
}

/// Extract a canonical tar into the staged rootfs.
fn extract_into_rootfs(tar_path: &Path, rootfs: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::BufReader::new(std::fs::File::open(tar_path)?));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    // Ownership restoration needs root; the delta layer reads ownership
    // back from the filesystem either way.
    let is_root = std::fs::metadata("/proc/self")
        .map(|m| m.uid() == 0)
        .unwrap_or(false);
    archive.set_preserve_ownerships(is_root);

    archive.unpack(rootfs)?;

    Ok(())
}

/// Library-mode build backend.
pub struct ImageAssembler<'r> {
    runner: &'r dyn SecondStageRunner,
}

impl<'r> ImageAssembler<'r> {
    pub fn new(runner: &'r dyn SecondStageRunner) -> Self {
        Self { runner }
    }

    /// Run the full build, writing the OCI archive to `request.output`.
    pub fn build(&self, request: &BuildRequest) -> Result<()> {
        let epoch = request.source_date_epoch;

        let staging = self.prepare_staging(request)?;
        let mut archive = OciArchiveBuilder::new(&staging, epoch)?;

        let mut manifest_descriptors = Vec::new();

        for platform_build in &request.platforms {
            info!(platform = %platform_build.platform, "assembling image");

            let layers = self.platform_layers(&mut archive, request, platform_build)?;

            let config = ImageConfig {
                created: Some(epoch_rfc3339(epoch)),
                architecture: platform_build.platform.architecture.clone(),
                os: platform_build.platform.os.clone(),
                variant: platform_build.platform.variant.clone(),
                config: request.container.clone(),
                rootfs: RootFs {
                    fs_type: "layers".to_string(),
                    diff_ids: layers.iter().map(|l| l.layer.diff_id.clone()).collect(),
                },
                history: layers
                    .iter()
                    .map(|l| History {
                        created: Some(epoch_rfc3339(epoch)),
                        created_by: Some(l.created_by.clone()),
                        empty_layer: None,
                    })
                    .collect(),
            };

            let config_descriptor = archive.add_json_blob(MEDIA_TYPE_CONFIG, &config)?;

            let manifest = Manifest {
                schema_version: 2,
                media_type: MEDIA_TYPE_MANIFEST.to_string(),
                config: config_descriptor,
                layers: layers.into_iter().map(|l| l.layer.descriptor).collect(),
            };

            let mut descriptor = archive.add_json_blob(MEDIA_TYPE_MANIFEST, &manifest)?;
            descriptor.platform = Some(platform_build.platform.oci_platform());

            manifest_descriptors.push(descriptor);
        }

        // One nested index holds the per-platform manifests; the
        // top-level index references it once per tag.
        let platform_index = Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_INDEX.to_string(),
            manifests: manifest_descriptors,
            annotations: None,
        };

        let index_descriptor = archive.add_json_blob(MEDIA_TYPE_INDEX, &platform_index)?;

        let top_manifests = if request.tags.is_empty() {
            vec![index_descriptor]
        } else {
            request
                .tags
                .iter()
                .map(|tag| {
                    let mut descriptor = index_descriptor.clone();
                    descriptor.annotations = Some(BTreeMap::from([(
                        ANNOTATION_REF_NAME.to_string(),
                        tag.clone(),
                    )]));
                    descriptor
                })
                .collect()
        };

        let top_index = Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_INDEX.to_string(),
            manifests: top_manifests,
            annotations: None,
        };

        archive.write_archive(&top_index, &request.output)?;

        info!(output = %request.output.display(), "wrote OCI image archive");

        Ok(())
    }

    /// Create the blob staging directory, retrying once after cleanup.
    fn prepare_staging(&self, request: &BuildRequest) -> Result<PathBuf> {
        let staging = request
            .platforms
            .first()
            .map(|p| p.scratch.parent().unwrap_or(&p.scratch).join("oci-staging"))
            .unwrap_or_else(|| PathBuf::from("oci-staging"));

        if let Err(first) = std::fs::create_dir_all(&staging) {
            warn!(error = %first, "staging setup failed; retrying after cleanup");
            let _ = std::fs::remove_dir_all(&staging);

            std::fs::create_dir_all(&staging)
                .map_err(|e| BuildError::BackendStartFailure(e.to_string()))?;
        }

        Ok(staging)
    }

    fn platform_layers(
        &self,
        archive: &mut OciArchiveBuilder,
        request: &BuildRequest,
        platform_build: &PlatformBuild,
    ) -> Result<Vec<AnnotatedLayer>> {
        let mut layers = Vec::new();

        for data_archive in &platform_build.data_archives {
            let layer = archive.add_layer_from_tar(data_archive)?;
            layers.push(AnnotatedLayer {
                created_by: format!(
                    "deboci unpack {}",
                    data_archive
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                ),
                layer,
            });
        }

        let db_layer = archive.add_layer_from_tar(&platform_build.dpkg_database_archive)?;
        layers.push(AnnotatedLayer {
            created_by: "deboci dpkg-database".to_string(),
            layer: db_layer,
        });

        if request.download_only {
            return Ok(layers);
        }

        let rootfs = platform_build.scratch.join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        for data_archive in &platform_build.data_archives {
            extract_into_rootfs(data_archive, &rootfs)?;
        }
        extract_into_rootfs(&platform_build.dpkg_database_archive, &rootfs)?;

        debug!(rootfs = %rootfs.display(), "staged rootfs; snapshotting");
        let before = snapshot_tree(&rootfs)?;

        // Second-stage inputs live at fixed in-image paths and are
        // removed again before the delta is captured.
        let sbin = rootfs.join("usr/sbin");
        std::fs::create_dir_all(&sbin)?;
        let stage_binary = sbin.join("second-stage");
        std::fs::copy(&request.second_stage_binary, &stage_binary)?;
        std::fs::set_permissions(&stage_binary, std::fs::Permissions::from_mode(0o755))?;

        let tmp = rootfs.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        std::fs::copy(&request.recipe_path, tmp.join("recipe.yaml"))?;
        std::fs::write(
            tmp.join("configure-order"),
            platform_build.configure_order.join("\n") + "\n",
        )?;

        self.runner.run(&rootfs, &["merge-usr"])?;
        self.runner
            .run(&rootfs, &["provision", "-f", "/tmp/recipe.yaml"])?;

        std::fs::remove_file(&stage_binary)?;
        std::fs::remove_file(tmp.join("recipe.yaml"))?;
        let _ = std::fs::remove_file(tmp.join("configure-order"));

        let delta_path = platform_build.scratch.join("provision.tar");
        if write_delta_layer(&rootfs, &before, &delta_path, request.source_date_epoch)? {
            let layer = archive.add_layer_from_tar(&delta_path)?;
            layers.push(AnnotatedLayer {
                created_by: "deboci second-stage".to_string(),
                layer,
            });
        }

        Ok(layers)
    }
}

struct AnnotatedLayer {
    created_by: String,
    layer: StagedLayer,
}

fn epoch_rfc3339(epoch: u64) -> String {
    DateTime::from_timestamp(epoch as i64, 0)
        .expect("epoch in range")
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const EPOCH: u64 = 1700000000;

    struct NoopRunner;

    impl SecondStageRunner for NoopRunner {
        fn run(&self, _rootfs: &Path, _args: &[&str]) -> Result<()> {
            Ok(())
        }
    }

    fn canonical_tar(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());

        for (entry_path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o644);
            header.set_mtime(EPOCH);
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, *entry_path, *content)
                .unwrap();
        }

        builder.into_inner().unwrap();
        path
    }

    #[test]
    fn platform_parsing() -> Result<()> {
        let p = PlatformSpec::parse("linux/amd64")?;
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "amd64");
        assert_eq!(p.debian_architecture()?, "amd64");
        assert_eq!(p.scratch_name(), "linux-amd64");

        let p = PlatformSpec::parse("linux/arm/v7")?;
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.debian_architecture()?, "armhf");
        assert_eq!(p.to_string(), "linux/arm/v7");

        assert_eq!(
            PlatformSpec::parse("linux/ppc64le")?.debian_architecture()?,
            "ppc64el"
        );

        assert!(PlatformSpec::parse("windows/amd64").is_err());
        assert!(PlatformSpec::parse("linux").is_err());

        Ok(())
    }

    fn build_request(dir: &Path, platforms: &[&str], tags: Vec<String>) -> BuildRequest {
        let recipe_path = dir.join("recipe.yaml");
        std::fs::write(&recipe_path, "apiVersion: v1alpha1\nkind: Recipe\n").unwrap();

        let platforms = platforms
            .iter()
            .map(|spec| {
                let platform = PlatformSpec::parse(spec).unwrap();
                let scratch = dir.join(platform.scratch_name());
                std::fs::create_dir_all(&scratch).unwrap();

                let data = canonical_tar(
                    &scratch,
                    "base-files.data.tar",
                    &[("./etc/debian_version", b"12.4\n")],
                );
                let db = canonical_tar(
                    &scratch,
                    "dpkg-db.tar",
                    &[("./var/lib/dpkg/status", b"Package: base-files\n")],
                );

                PlatformBuild {
                    platform,
                    data_archives: vec![data],
                    dpkg_database_archive: db,
                    configure_order: vec!["base-files".to_string()],
                    scratch,
                }
            })
            .collect();

        BuildRequest {
            output: dir.join("image.tar"),
            tags,
            download_only: true,
            source_date_epoch: EPOCH,
            container: ContainerConfig::default(),
            recipe_path,
            second_stage_binary: PathBuf::from("/proc/self/exe"),
            platforms,
        }
    }

    fn read_archive_json(
        archive_bytes: &[u8],
        path_wanted: &str,
    ) -> Option<serde_json::Value> {
        let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == path_wanted {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                return Some(serde_json::from_slice(&data).unwrap());
            }
        }
        None
    }

    fn blob_json(archive_bytes: &[u8], digest: &str) -> serde_json::Value {
        let path = format!("blobs/sha256/{}", digest.strip_prefix("sha256:").unwrap());
        read_archive_json(archive_bytes, &path).expect("blob present")
    }

    #[test]
    fn multi_platform_archive_shape() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let request = build_request(
            dir.path(),
            &["linux/amd64", "linux/arm64"],
            vec!["example.org/base:latest".to_string()],
        );

        ImageAssembler::new(&NoopRunner).build(&request)?;

        let archive_bytes = std::fs::read(&request.output)?;

        let index = read_archive_json(&archive_bytes, "index.json").unwrap();
        let top_manifests = index["manifests"].as_array().unwrap();
        assert_eq!(top_manifests.len(), 1);
        assert_eq!(
            top_manifests[0]["annotations"][ANNOTATION_REF_NAME],
            "example.org/base:latest"
        );

        // The nested index lists one manifest per platform.
        let nested = blob_json(&archive_bytes, top_manifests[0]["digest"].as_str().unwrap());
        let manifests = nested["manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 2);

        let mut architectures = Vec::new();
        for descriptor in manifests {
            assert_eq!(descriptor["platform"]["os"], "linux");

            let manifest = blob_json(&archive_bytes, descriptor["digest"].as_str().unwrap());
            // Package layer + dpkg database layer.
            assert_eq!(manifest["layers"].as_array().unwrap().len(), 2);

            let config = blob_json(&archive_bytes, manifest["config"]["digest"].as_str().unwrap());
            architectures.push(config["architecture"].as_str().unwrap().to_string());
            assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 2);
        }

        architectures.sort();
        assert_eq!(architectures, vec!["amd64", "arm64"]);

        Ok(())
    }

    #[test]
    fn untagged_build_references_index_directly() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let request = build_request(dir.path(), &["linux/amd64"], vec![]);
        ImageAssembler::new(&NoopRunner).build(&request)?;

        let archive_bytes = std::fs::read(&request.output)?;
        let index = read_archive_json(&archive_bytes, "index.json").unwrap();
        let manifests = index["manifests"].as_array().unwrap();

        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].get("annotations").is_none());

        Ok(())
    }

    #[test]
    fn build_is_deterministic() -> Result<()> {
        let run = || -> Result<Vec<u8>> {
            let dir = tempfile::tempdir()?;
            let request = build_request(dir.path(), &["linux/amd64"], vec![]);
            ImageAssembler::new(&NoopRunner).build(&request)?;
            Ok(std::fs::read(&request.output)?)
        };

        assert_eq!(run()?, run()?);

        Ok(())
    }

    #[test]
    fn provisioned_build_adds_delta_layer() -> Result<()> {
        // A runner that mutates the rootfs the way a real second stage
        // would.
        struct TouchingRunner;

        impl SecondStageRunner for TouchingRunner {
            fn run(&self, rootfs: &Path, args: &[&str]) -> Result<()> {
                if args[0] == "provision" {
                    std::fs::create_dir_all(rootfs.join("etc"))?;
                    std::fs::write(rootfs.join("etc/hostname"), "debian\n")?;
                    std::fs::remove_file(rootfs.join("etc/debian_version"))?;
                }
                Ok(())
            }
        }

        let dir = tempfile::tempdir()?;
        let mut request = build_request(dir.path(), &["linux/amd64"], vec![]);
        request.download_only = false;

        ImageAssembler::new(&TouchingRunner).build(&request)?;

        let archive_bytes = std::fs::read(&request.output)?;
        let index = read_archive_json(&archive_bytes, "index.json").unwrap();
        let nested = blob_json(
            &archive_bytes,
            index["manifests"][0]["digest"].as_str().unwrap(),
        );
        let manifest = blob_json(
            &archive_bytes,
            nested["manifests"][0]["digest"].as_str().unwrap(),
        );

        // Package layer + dpkg db layer + provisioning delta.
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 3);

        Ok(())
    }

    #[test]
    fn delta_layer_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc"))?;
        std::fs::write(rootfs.join("etc/keep"), "keep")?;
        std::fs::write(rootfs.join("etc/remove"), "remove")?;
        std::fs::write(rootfs.join("etc/change"), "old")?;

        let before = snapshot_tree(&rootfs)?;

        std::fs::write(rootfs.join("etc/change"), "new!")?;
        std::fs::write(rootfs.join("etc/added"), "added")?;
        std::fs::remove_file(rootfs.join("etc/remove"))?;

        let delta = dir.path().join("delta.tar");
        assert!(write_delta_layer(&rootfs, &before, &delta, EPOCH)?);

        let mut archive = tar::Archive::new(std::fs::File::open(&delta)?);
        let mut paths = archive
            .entries()?
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        paths.sort();

        assert_eq!(
            paths,
            vec!["./etc/.wh.remove", "./etc/added", "./etc/change"]
        );

        Ok(())
    }

    #[test]
    fn unchanged_tree_produces_no_delta() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc"))?;
        std::fs::write(rootfs.join("etc/keep"), "keep")?;

        let before = snapshot_tree(&rootfs)?;

        let delta = dir.path().join("delta.tar");
        assert!(!write_delta_layer(&rootfs, &before, &delta, EPOCH)?);

        Ok(())
    }
}
