//! The submitted analysis: what the user asked to run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("unknown step input type {kind:?}"))]
    UnknownInputType { kind: String },
}

/// A user-scoped interactive workload: an image plus resource hints,
/// input/output bindings, and environment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Analysis {
    /// Stable opaque identifier; becomes the `external-id` label of every
    /// resource launched for this analysis.
    pub invocation_id: String,

    pub analysis_id: String,
    pub app_id: String,
    pub app_name: String,
    pub analysis_name: String,
    pub user_id: String,

    /// The submitting user, possibly carrying the installation's username
    /// suffix (e.g. `ipcdev@iplantcollaborative.org`).
    pub username: String,

    /// Data-store folder the analysis outputs are uploaded to.
    pub output_dir: String,

    pub container: ContainerSpec,

    #[serde(default)]
    pub inputs: Vec<StepInput>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub image: ContainerImage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    /// UID the analysis runs as; also used as the pod's fsGroup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,

    #[serde(default)]
    pub ports: Vec<ContainerPortSpec>,
    #[serde(default)]
    pub devices: Vec<ContainerDevice>,
    #[serde(default)]
    pub volumes: Vec<ContainerVolume>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: ResourceHints,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerImage {
    pub name: String,
    pub tag: String,
}

impl ContainerImage {
    /// The full `name:tag` reference, defaulting the tag to `latest`.
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            format!("{}:latest", self.name)
        } else {
            format!("{}:{}", self.name, self.tag)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ContainerPortSpec {
    pub container_port: i32,
}

/// A device requested by the tool definition.
///
/// Two host paths get special treatment: `/dev/nvidia*` entries are a legacy
/// way of requesting a GPU, and `/dev/shm` requests an enlarged shared-memory
/// segment whose size rides in `container_path`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerDevice {
    pub host_path: String,
    pub container_path: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerVolume {
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// CPU, memory, disk and GPU requirements from the tool definition. All
/// optional; the builder substitutes documented defaults.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu_cores: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_cores: Option<f64>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_limit: Option<i64>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<i64>,
    /// Bytes of ephemeral scratch space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk_space: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<i64>,
}

/// One input binding of the analysis.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StepInput {
    pub id: String,
    /// Basename the input is staged under.
    pub name: String,
    /// Source path in the data store.
    pub value: String,
    /// Input kind as submitted; see [`StepInput::kind`] for accepted values.
    #[serde(rename = "type")]
    pub kind: String,
    /// Upload ticket, when the data store issued one for this input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
}

/// The recognized step input kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    FileInput,
    FolderInput,
    MultiFileSelector,
}

impl StepInput {
    /// Parses the submitted input type, rejecting anything unrecognized.
    pub fn kind(&self) -> Result<InputKind> {
        match self.kind.as_str() {
            "FileInput" => Ok(InputKind::FileInput),
            "FolderInput" => Ok(InputKind::FolderInput),
            "MultiFileSelector" => Ok(InputKind::MultiFileSelector),
            _ => UnknownInputTypeSnafu { kind: &self.kind }.fail(),
        }
    }

    /// The source path in the data store for this input.
    pub fn irods_path(&self) -> Result<String> {
        // All recognized kinds stage from `value`; the match still runs so an
        // unknown type fails the build instead of staging garbage.
        self.kind()?;
        Ok(self.value.clone())
    }

    /// The basename the input is staged under inside the analysis container.
    pub fn basename(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.value
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl Analysis {
    /// True when the analysis wants GPU scheduling, either via an explicit
    /// GPU count or the legacy `/dev/nvidia*` device entries.
    pub fn needs_gpu(&self) -> bool {
        self.container.resources.gpus.is_some_and(|count| count > 0)
            || self
                .container
                .devices
                .iter()
                .any(|device| device.host_path.starts_with("/dev/nvidia"))
    }

    /// The number of GPUs to request when [`Analysis::needs_gpu`] is true.
    pub fn gpu_count(&self) -> i64 {
        self.container.resources.gpus.filter(|count| *count > 0).unwrap_or(1)
    }

    /// The shared-memory device entry, if one was declared.
    pub fn shm_device(&self) -> Option<&ContainerDevice> {
        self.container
            .devices
            .iter()
            .find(|device| device.host_path == "/dev/shm")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("FileInput", InputKind::FileInput)]
    #[case("FolderInput", InputKind::FolderInput)]
    #[case("MultiFileSelector", InputKind::MultiFileSelector)]
    fn recognized_input_kinds(#[case] kind: &str, #[case] expected: InputKind) {
        let input = StepInput {
            kind: kind.to_string(),
            ..StepInput::default()
        };
        assert_eq!(input.kind().unwrap(), expected);
    }

    #[test]
    fn unknown_input_kind() {
        let input = StepInput {
            kind: "ReferenceGenome".to_string(),
            ..StepInput::default()
        };
        let err = input.kind().unwrap_err();
        assert_eq!(err.to_string(), "unknown step input type \"ReferenceGenome\"");
    }

    #[test]
    fn basename_falls_back_to_value() {
        let input = StepInput {
            name: String::new(),
            value: "/iplant/home/ipcdev/reads.fastq".to_string(),
            ..StepInput::default()
        };
        assert_eq!(input.basename(), "reads.fastq");
    }

    #[test]
    fn legacy_nvidia_device_requests_gpu() {
        let analysis = Analysis {
            container: ContainerSpec {
                devices: vec![ContainerDevice {
                    host_path: "/dev/nvidia0".to_string(),
                    container_path: "/dev/nvidia0".to_string(),
                }],
                ..ContainerSpec::default()
            },
            ..Analysis::default()
        };

        assert!(analysis.needs_gpu());
        assert_eq!(analysis.gpu_count(), 1);
    }

    #[test]
    fn explicit_gpu_count_wins() {
        let analysis = Analysis {
            container: ContainerSpec {
                resources: ResourceHints {
                    gpus: Some(2),
                    ..ResourceHints::default()
                },
                ..ContainerSpec::default()
            },
            ..Analysis::default()
        };

        assert!(analysis.needs_gpu());
        assert_eq!(analysis.gpu_count(), 2);
    }

    #[test]
    fn image_reference_defaults_tag() {
        let image = ContainerImage {
            name: "quay.io/cyverse/jupyterlab".to_string(),
            tag: String::new(),
        };
        assert_eq!(image.reference(), "quay.io/cyverse/jupyterlab:latest");
    }
}
