// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Declarative build recipes.

Recipes are YAML documents discriminated by `(apiVersion, kind)`. Only
`(v1alpha1, Recipe)` is understood; anything else fails at load.
*/

use {
    crate::{
        error::{BuildError, Result},
        oci::ContainerConfig,
        source::SourceConfig,
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

pub const API_VERSION: &str = "v1alpha1";
pub const KIND: &str = "Recipe";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub api_version: String,
    pub kind: String,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub packages: PackagesSpec,

    #[serde(default)]
    pub options: OptionsSpec,

    #[serde(default)]
    pub container: Option<ContainerSpec>,

    #[serde(default)]
    pub users: Vec<UserSpec>,

    #[serde(default)]
    pub groups: Vec<GroupSpec>,

    #[serde(default)]
    pub files: Vec<FileSpec>,

    #[serde(default)]
    pub content: Vec<ContentSpec>,

    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackagesSpec {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionsSpec {
    /// Skip the implicit selection of priority-required packages.
    #[serde(default)]
    pub omit_required: bool,

    /// Stop after composing package layers; no in-image second stage.
    #[serde(default)]
    pub download_only: bool,

    /// Prune documentation, locales, and manuals in the second stage.
    #[serde(default)]
    pub slim: bool,
}

/// Container runtime configuration carried into the image config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerSpec {
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub exposed_ports: Vec<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub stop_signal: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserSpec {
    pub name: String,

    #[serde(default)]
    pub uid: Option<u32>,

    #[serde(default)]
    pub gid: Option<u32>,

    #[serde(default)]
    pub home: Option<String>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,

    #[serde(default)]
    pub gid: Option<u32>,
}

/// Ensure a path exists with the given attributes.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileSpec {
    pub path: String,

    #[serde(default)]
    pub directory: bool,

    /// Octal mode string, e.g. `"0755"`.
    #[serde(default)]
    pub mode: Option<String>,
}

/// Write inline content to a path.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContentSpec {
    pub path: String,

    pub data: String,

    #[serde(default)]
    pub mode: Option<String>,
}

/// Parse an octal mode string.
pub fn parse_mode(mode: &str) -> Result<u32> {
    u32::from_str_radix(mode, 8)
        .map_err(|_| BuildError::RecipeMalformed(format!("invalid file mode: {}", mode)))
}

impl Recipe {
    /// Load a recipe from YAML, dispatching on `(apiVersion, kind)`.
    pub fn from_yaml<R: std::io::Read>(reader: R) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_reader(reader)
            .map_err(|e| BuildError::RecipeMalformed(e.to_string()))?;

        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if (api_version.as_str(), kind.as_str()) != (API_VERSION, KIND) {
            return Err(BuildError::RecipeMalformed(format!(
                "unknown recipe type: apiVersion={:?} kind={:?}",
                api_version, kind
            )));
        }

        serde_yaml::from_value(value).map_err(|e| BuildError::RecipeMalformed(e.to_string()))
    }

    /// The container image config derived from this recipe.
    pub fn container_config(&self) -> ContainerConfig {
        let container = match &self.container {
            Some(container) => container,
            None => return ContainerConfig::default(),
        };

        let set_map = |keys: &[String]| {
            if keys.is_empty() {
                None
            } else {
                Some(
                    keys.iter()
                        .map(|k| (k.clone(), serde_json::json!({})))
                        .collect::<BTreeMap<_, _>>(),
                )
            }
        };

        let non_empty = |v: &Vec<String>| {
            if v.is_empty() {
                None
            } else {
                Some(v.clone())
            }
        };

        ContainerConfig {
            user: container.user.clone(),
            exposed_ports: set_map(&container.exposed_ports),
            env: non_empty(&container.env),
            entrypoint: non_empty(&container.entrypoint),
            cmd: non_empty(&container.cmd),
            volumes: set_map(&container.volumes),
            working_dir: container.working_dir.clone(),
            labels: if container.labels.is_empty() {
                None
            } else {
                Some(container.labels.clone())
            },
            stop_signal: container.stop_signal.clone(),
        }
    }
}
