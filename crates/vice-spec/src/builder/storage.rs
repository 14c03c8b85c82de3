//! Volumes, claims, and storage-driver path mappings for one analysis.
//!
//! Two staging modes exist. Without the storage driver, inputs are copied by
//! the file-transfer containers into a `working-dir` claim. With the driver,
//! the bundle carries exactly one persistent volume bound to the iRODS CSI
//! driver whose attributes embed a JSON list of path mappings, and the
//! file-transfer containers disappear from the pod.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        CSIPersistentVolumeSource, ConfigMapVolumeSource, EmptyDirVolumeSource, PersistentVolume,
        PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
        PersistentVolumeSpec, Volume, VolumeMount, VolumeResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    BuildContext, CSI_MOUNT, CSI_VOLUME, DuplicateMountSnafu, EXCLUDES_MOUNT, EXCLUDES_VOLUME,
    InputSnafu, PATH_LIST_MOUNT, PATH_LIST_VOLUME, Result, SHM_VOLUME, WORKING_DIR_MOUNT,
    WORKING_DIR_VOLUME, byte_quantity, config_blobs,
};
use crate::analysis::InputKind;

/// Name of the iRODS CSI driver.
const CSI_DRIVER_NAME: &str = "irods.csi.cyverse.org";

/// Scratch space given to an analysis that requested no explicit disk size.
const DEFAULT_DISK_SPACE: &str = "1Gi";

/// Capacity stamped on the CSI persistent volume; the driver ignores it but
/// the API requires a value.
const CSI_CAPACITY: &str = "5Gi";

/// Working directory of analyses that declare none.
pub(crate) const DEFAULT_WORKING_DIR: &str = "/de-app-work";

/// One entry of the storage driver's `path_mapping_json` attribute.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PathMapping {
    pub irods_path: String,
    pub mapping_path: String,
    pub resource_type: String,
    pub read_only: bool,
    pub create_dir: bool,
    pub ignore_not_exist_error: bool,
}

/// The storage half of a bundle, consumed by the workload builder.
pub(crate) struct StoragePlan {
    pub volumes: Vec<Volume>,
    pub analysis_mounts: Vec<VolumeMount>,
    /// Mounts shared by the staging init container and the file-transfer
    /// sidecar; empty when the storage driver is on.
    pub transfer_mounts: Vec<VolumeMount>,
    pub persistent_volumes: Vec<PersistentVolume>,
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
}

pub(crate) fn working_dir_claim_name(external_id: &str) -> String {
    format!("working-dir-{external_id}")
}

pub(crate) fn csi_data_name(external_id: &str) -> String {
    format!("csi-data-{external_id}")
}

/// The path an input is staged under inside the analysis container.
fn staging_target(base: &str, basename: &str) -> String {
    format!("{base}/{basename}")
}

pub(crate) fn plan(ctx: &BuildContext<'_>, has_path_list: bool) -> Result<StoragePlan> {
    // Every input must land on a distinct path no matter which staging mode
    // is active; two inputs with the same basename would silently clobber
    // each other otherwise.
    let input_base = if ctx.config.use_csi_driver {
        "/input"
    } else {
        WORKING_DIR_MOUNT
    };
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for input in &ctx.analysis.inputs {
        let irods_path = input.irods_path().context(InputSnafu)?;
        let target = staging_target(input_base, &input.basename());

        if let Some(existing) = seen.insert(target.clone(), irods_path.clone()) {
            return DuplicateMountSnafu {
                irods_path,
                mount_path: target,
                existing,
            }
            .fail();
        }
    }

    let mut plan = if ctx.config.use_csi_driver {
        csi_plan(ctx)?
    } else {
        transfer_plan(ctx, has_path_list)
    };

    if let Some(shm) = ctx.analysis.shm_device() {
        plan.volumes.push(Volume {
            name: SHM_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: Some(Quantity(shm.container_path.clone())),
            }),
            ..Volume::default()
        });
        plan.analysis_mounts.push(VolumeMount {
            name: SHM_VOLUME.to_string(),
            mount_path: "/dev/shm".to_string(),
            ..VolumeMount::default()
        });
    }

    // Tool-defined scratch directories become anonymous empty dirs.
    for (i, volume) in ctx.analysis.container.volumes.iter().enumerate() {
        let name = format!("vol-{i}");
        plan.volumes.push(Volume {
            name: name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
        plan.analysis_mounts.push(VolumeMount {
            name,
            mount_path: volume.container_path.clone(),
            read_only: Some(volume.read_only),
            ..VolumeMount::default()
        });
    }

    Ok(plan)
}

/// Staging through the file-transfer containers and a working-dir claim.
fn transfer_plan(ctx: &BuildContext<'_>, has_path_list: bool) -> StoragePlan {
    let claim_name = working_dir_claim_name(ctx.external_id);

    let storage = ctx
        .analysis
        .container
        .resources
        .min_disk_space
        .map_or_else(|| Quantity(DEFAULT_DISK_SPACE.to_string()), byte_quantity);

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.clone()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), storage)])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    };

    let mut volumes = vec![
        Volume {
            name: WORKING_DIR_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                ..PersistentVolumeClaimVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: EXCLUDES_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_blobs::excludes_name(ctx.external_id),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
    ];

    let mut transfer_mounts = vec![
        VolumeMount {
            name: WORKING_DIR_VOLUME.to_string(),
            mount_path: WORKING_DIR_MOUNT.to_string(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: EXCLUDES_VOLUME.to_string(),
            mount_path: EXCLUDES_MOUNT.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    ];

    if has_path_list {
        volumes.push(Volume {
            name: PATH_LIST_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_blobs::path_list_name(ctx.external_id),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
        transfer_mounts.push(VolumeMount {
            name: PATH_LIST_VOLUME.to_string(),
            mount_path: PATH_LIST_MOUNT.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    let working_dir = ctx
        .analysis
        .container
        .working_directory
        .clone()
        .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string());

    StoragePlan {
        volumes,
        analysis_mounts: vec![VolumeMount {
            name: WORKING_DIR_VOLUME.to_string(),
            mount_path: working_dir,
            ..VolumeMount::default()
        }],
        transfer_mounts,
        persistent_volumes: Vec::new(),
        persistent_volume_claims: vec![claim],
    }
}

/// Staging through the iRODS CSI driver.
fn csi_plan(ctx: &BuildContext<'_>) -> Result<StoragePlan> {
    let name = csi_data_name(ctx.external_id);
    let mappings = path_mappings(ctx)?;
    let mappings_json =
        serde_json::to_string(&mappings).unwrap_or_else(|_| "[]".to_string());

    let volume_attributes = BTreeMap::from([
        ("client".to_string(), "irodsfuse".to_string()),
        ("path_mapping_json".to_string(), mappings_json),
        ("no_permission_check".to_string(), "true".to_string()),
    ]);

    let pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(CSI_CAPACITY.to_string()),
            )])),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            // Empty storage class on both sides pins the claim to this
            // exact volume instead of a dynamic provisioner.
            storage_class_name: Some(String::new()),
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER_NAME.to_string(),
                volume_handle: name.clone(),
                volume_attributes: Some(volume_attributes),
                ..CSIPersistentVolumeSource::default()
            }),
            ..PersistentVolumeSpec::default()
        }),
        ..PersistentVolume::default()
    };

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(CSI_CAPACITY.to_string()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            storage_class_name: Some(String::new()),
            volume_name: Some(name.clone()),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    };

    Ok(StoragePlan {
        volumes: vec![Volume {
            name: CSI_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: name,
                ..PersistentVolumeClaimVolumeSource::default()
            }),
            ..Volume::default()
        }],
        analysis_mounts: vec![VolumeMount {
            name: CSI_VOLUME.to_string(),
            mount_path: CSI_MOUNT.to_string(),
            ..VolumeMount::default()
        }],
        transfer_mounts: Vec::new(),
        persistent_volumes: vec![pv],
        persistent_volume_claims: vec![pvc],
    })
}

/// The full mapping list: inputs read-only, the output folder read-write,
/// optionally the user's home, and the zone's shared home.
pub(crate) fn path_mappings(ctx: &BuildContext<'_>) -> Result<Vec<PathMapping>> {
    let mut mappings = Vec::new();

    for input in &ctx.analysis.inputs {
        let kind = input.kind().context(InputSnafu)?;
        let resource_type = match kind {
            InputKind::FileInput => "file",
            InputKind::FolderInput | InputKind::MultiFileSelector => "dir",
        };

        mappings.push(PathMapping {
            irods_path: input.irods_path().context(InputSnafu)?,
            mapping_path: staging_target("/input", &input.basename()),
            resource_type: resource_type.to_string(),
            read_only: true,
            create_dir: false,
            ignore_not_exist_error: true,
        });
    }

    mappings.push(PathMapping {
        irods_path: ctx.analysis.output_dir.clone(),
        mapping_path: "/output".to_string(),
        resource_type: "dir".to_string(),
        read_only: false,
        create_dir: true,
        ignore_not_exist_error: false,
    });

    if ctx.config.mount_irods_home && !ctx.username.is_empty() {
        mappings.push(PathMapping {
            irods_path: format!("/{}/home/{}", ctx.config.irods_zone, ctx.username),
            mapping_path: "/home".to_string(),
            resource_type: "dir".to_string(),
            read_only: false,
            create_dir: false,
            ignore_not_exist_error: true,
        });
    }

    mappings.push(PathMapping {
        irods_path: format!("/{}/home/shared", ctx.config.irods_zone),
        mapping_path: "/shared".to_string(),
        resource_type: "dir".to_string(),
        read_only: false,
        create_dir: false,
        ignore_not_exist_error: true,
    });

    Ok(mappings)
}
