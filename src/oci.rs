// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OCI image primitives.

Serde models for the OCI image specification (manifests, indexes, image
configs) and a deterministic writer for image-layout archives
(`oci-layout` + `index.json` + blob store in one tar). See
<https://github.com/opencontainers/image-spec>.
*/

use {
    crate::error::Result,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{
        collections::BTreeMap,
        io::{Read, Write},
        path::{Path, PathBuf},
    },
};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A target platform.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A content-addressed reference to a blob.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    /// `sha256:<hex>`.
    pub digest: String,

    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An image manifest: one config and its layers.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// An image index: manifests for one or more platforms.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Runtime configuration carried inside the image config blob.
///
/// Field names follow the Go serialization the OCI spec inherited.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContainerConfig {
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(rename = "StopSignal", skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    pub diff_ids: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// The image config blob.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    pub architecture: String,
    pub os: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    pub config: ContainerConfig,

    pub rootfs: RootFs,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub history: Vec<History>,
}

fn digest_ref(hex: &str) -> String {
    format!("sha256:{}", hex)
}

/// A gzip layer blob staged for the archive.
#[derive(Clone, Debug)]
pub struct StagedLayer {
    /// Digest of the uncompressed tar, for `rootfs.diff_ids`.
    pub diff_id: String,

    /// Descriptor of the compressed blob.
    pub descriptor: Descriptor,
}

/// Accumulates blobs, then writes an OCI image-layout archive.
///
/// All emitted tar entries carry the clamp epoch so archives are
/// byte-identical across runs.
pub struct OciArchiveBuilder {
    staging: PathBuf,
    blobs: BTreeMap<String, PathBuf>,
    epoch: u64,
}

impl OciArchiveBuilder {
    /// Create a builder staging blobs under `staging`.
    pub fn new(staging: impl Into<PathBuf>, epoch: u64) -> Result<Self> {
        let staging = staging.into();
        std::fs::create_dir_all(&staging)?;

        Ok(Self {
            staging,
            blobs: BTreeMap::new(),
            epoch,
        })
    }

    /// Stage a blob from bytes. Returns `(hex digest, size)`.
    pub fn add_blob(&mut self, data: &[u8]) -> Result<(String, u64)> {
        let digest = hex::encode(Sha256::digest(data));
        let path = self.staging.join(&digest);

        if !path.exists() {
            std::fs::write(&path, data)?;
        }

        self.blobs.insert(digest.clone(), path);

        Ok((digest, data.len() as u64))
    }

    /// Stage a JSON blob, returning its descriptor.
    pub fn add_json_blob<T: Serialize>(&mut self, media_type: &str, value: &T) -> Result<Descriptor> {
        let data = serde_json::to_vec(value)?;
        let (digest, size) = self.add_blob(&data)?;

        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest: digest_ref(&digest),
            size,
            platform: None,
            annotations: None,
        })
    }

    /// Gzip a canonical layer tar into a staged blob.
    ///
    /// The `diff_id` is the digest of the uncompressed tar; the
    /// descriptor digests the gzip stream. Gzip output carries no
    /// timestamp, so identical tars stage identical blobs.
    pub fn add_layer_from_tar(&mut self, tar_path: &Path) -> Result<StagedLayer> {
        let mut tar_file = std::fs::File::open(tar_path)?;

        let mut diff_hasher = Sha256::new();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());

        let mut buf = [0u8; 65536];
        loop {
            let n = tar_file.read(&mut buf)?;
            if n == 0 {
                break;
            }

            diff_hasher.update(&buf[0..n]);
            encoder.write_all(&buf[0..n])?;
        }

        let compressed = encoder.finish()?;
        let diff_id = hex::encode(diff_hasher.finalize());
        let (digest, size) = self.add_blob(&compressed)?;

        Ok(StagedLayer {
            diff_id: digest_ref(&diff_id),
            descriptor: Descriptor {
                media_type: MEDIA_TYPE_LAYER_GZIP.to_string(),
                digest: digest_ref(&digest),
                size,
                platform: None,
                annotations: None,
            },
        })
    }

    /// Write the image-layout archive: `oci-layout`, `index.json`, and
    /// every staged blob, in sorted order.
    pub fn write_archive(&self, index: &Index, dest: &Path) -> Result<()> {
        let mut builder =
            tar::Builder::new(std::io::BufWriter::new(std::fs::File::create(dest)?));

        let file = |builder: &mut tar::Builder<_>, path: &str, content: &[u8]| -> Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o644);
            header.set_mtime(self.epoch);
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, content)?;
            Ok(())
        };

        let dir = |builder: &mut tar::Builder<_>, path: &str| -> Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o755);
            header.set_mtime(self.epoch);
            header.set_size(0);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_cksum();
            builder.append_data(&mut header, path, std::io::empty())?;
            Ok(())
        };

        file(
            &mut builder,
            "oci-layout",
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        file(&mut builder, "index.json", &serde_json::to_vec(index)?)?;

        dir(&mut builder, "blobs/")?;
        dir(&mut builder, "blobs/sha256/")?;

        // BTreeMap iteration gives sorted digests.
        for (digest, blob_path) in &self.blobs {
            let mut blob_file = std::fs::File::open(blob_path)?;
            let size = blob_file.metadata()?.len();

            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o644);
            header.set_mtime(self.epoch);
            header.set_size(size);
            header.set_cksum();
            builder.append_data(
                &mut header,
                format!("blobs/sha256/{}", digest),
                &mut blob_file,
            )?;
        }

        builder.into_inner()?.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPOCH: u64 = 1700000000;

    fn sample_index(manifests: Vec<Descriptor>) -> Index {
        Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_INDEX.to_string(),
            manifests,
            annotations: None,
        }
    }

    #[test]
    fn blob_digest_is_content_address() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut builder = OciArchiveBuilder::new(dir.path().join("stage"), EPOCH)?;

        let (digest, size) = builder.add_blob(b"blob content")?;

        assert_eq!(size, 12);
        assert_eq!(digest, hex::encode(Sha256::digest(b"blob content")));

        Ok(())
    }

    #[test]
    fn layer_staging_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;

        // A small canonical tar.
        let tar_path = dir.path().join("layer.tar");
        {
            let mut tb = tar::Builder::new(std::fs::File::create(&tar_path)?);
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(0o644);
            header.set_mtime(EPOCH);
            header.set_size(5);
            header.set_cksum();
            tb.append_data(&mut header, "./etc/f", &b"hello"[..])?;
            tb.into_inner()?;
        }

        let mut builder = OciArchiveBuilder::new(dir.path().join("stage"), EPOCH)?;
        let layer = builder.add_layer_from_tar(&tar_path)?;

        let tar_bytes = std::fs::read(&tar_path)?;
        assert_eq!(
            layer.diff_id,
            format!("sha256:{}", hex::encode(Sha256::digest(&tar_bytes)))
        );
        assert_eq!(layer.descriptor.media_type, MEDIA_TYPE_LAYER_GZIP);

        // The staged blob gunzips back to the tar.
        let blob_digest = layer.descriptor.digest.strip_prefix("sha256:").unwrap();
        let blob = std::fs::read(dir.path().join("stage").join(blob_digest))?;

        let mut decompressed = Vec::new();
        flate2::read::GzDecoder::new(blob.as_slice()).read_to_end(&mut decompressed)?;
        assert_eq!(decompressed, tar_bytes);

        Ok(())
    }

    #[test]
    fn archive_layout_and_determinism() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let build = |staging: &Path, dest: &Path| -> Result<()> {
            let mut builder = OciArchiveBuilder::new(staging, EPOCH)?;
            builder.add_blob(b"layer-ish bytes")?;

            let manifest = builder.add_json_blob(
                MEDIA_TYPE_MANIFEST,
                &Manifest {
                    schema_version: 2,
                    media_type: MEDIA_TYPE_MANIFEST.to_string(),
                    config: Descriptor {
                        media_type: MEDIA_TYPE_CONFIG.to_string(),
                        digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string(),
                        size: 2,
                        platform: None,
                        annotations: None,
                    },
                    layers: vec![],
                },
            )?;

            builder.write_archive(&sample_index(vec![manifest]), dest)
        };

        let first = dir.path().join("first.tar");
        let second = dir.path().join("second.tar");
        build(&dir.path().join("stage1"), &first)?;
        build(&dir.path().join("stage2"), &second)?;

        assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);

        // Layout shape.
        let mut archive = tar::Archive::new(std::fs::File::open(&first)?);
        let paths = archive
            .entries()?
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();

        assert_eq!(paths[0], "oci-layout");
        assert_eq!(paths[1], "index.json");
        assert_eq!(paths[2], "blobs/");
        assert_eq!(paths[3], "blobs/sha256/");
        assert_eq!(paths.len(), 6);

        Ok(())
    }

    #[test]
    fn config_serialization_shape() -> Result<()> {
        let config = ImageConfig {
            created: Some("2024-02-10T11:07:25Z".to_string()),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
            config: ContainerConfig {
                env: Some(vec!["PATH=/usr/bin".to_string()]),
                cmd: Some(vec!["/bin/bash".to_string()]),
                ..Default::default()
            },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec!["sha256:abc".to_string()],
            },
            history: vec![],
        };

        let json = serde_json::to_string(&config)?;

        assert!(json.contains("\"architecture\":\"amd64\""));
        assert!(json.contains("\"Env\":[\"PATH=/usr/bin\"]"));
        assert!(json.contains("\"type\":\"layers\""));
        // Unset runtime fields are omitted entirely.
        assert!(!json.contains("User"));

        Ok(())
    }

    #[test]
    fn manifest_serialization_uses_camel_case() -> Result<()> {
        let manifest = Manifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.to_string(),
                digest: "sha256:ab".to_string(),
                size: 2,
                platform: None,
                annotations: None,
            },
            layers: vec![],
        };

        let json = serde_json::to_string(&manifest)?;
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("\"mediaType\""));

        Ok(())
    }
}
