//! Config blobs staged into the analysis pod for the file-transfer binary.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::BuildContext;

/// Data key of the excludes blob inside its config map.
pub(crate) const EXCLUDES_KEY: &str = "excludes-file";

/// Data key of the input path list inside its config map.
pub(crate) const PATH_LIST_KEY: &str = "input-path-list";

/// First line of a DE path-list file.
const PATH_LIST_HEADER: &str = "# application/vnd.de.path-list+csv; version=1";

pub(crate) fn excludes_name(external_id: &str) -> String {
    format!("excludes-file-{external_id}")
}

pub(crate) fn path_list_name(external_id: &str) -> String {
    format!("input-path-list-{external_id}")
}

/// Builds the config maps of the bundle and reports whether an
/// `input-path-list` blob was emitted.
///
/// The excludes file keeps staged inputs from being uploaded back to the
/// data store alongside the outputs, so it is emitted for every analysis.
/// The path list is only consumed by the staging container, and only for
/// inputs the data store issued no upload ticket for; the blob is omitted
/// when the storage driver is mounted or when every input carries a ticket.
pub(crate) fn build(ctx: &BuildContext<'_>) -> (Vec<ConfigMap>, bool) {
    let mut config_maps = vec![excludes_file(ctx)];

    let ticketless: Vec<&crate::analysis::StepInput> = ctx
        .analysis
        .inputs
        .iter()
        .filter(|input| input.ticket.is_none())
        .collect();

    let wants_path_list = !ctx.config.use_csi_driver && !ticketless.is_empty();
    if wants_path_list {
        let mut lines = vec![PATH_LIST_HEADER.to_string()];
        lines.extend(ticketless.iter().map(|input| input.value.clone()));

        config_maps.push(blob(
            ctx,
            path_list_name(ctx.external_id),
            PATH_LIST_KEY,
            format!("{}\n", lines.join("\n")),
        ));
    }

    (config_maps, wants_path_list)
}

fn excludes_file(ctx: &BuildContext<'_>) -> ConfigMap {
    let mut lines: Vec<String> = ctx
        .analysis
        .inputs
        .iter()
        .map(crate::analysis::StepInput::basename)
        .collect();
    lines.push("logs".to_string());

    blob(
        ctx,
        excludes_name(ctx.external_id),
        EXCLUDES_KEY,
        format!("{}\n", lines.join("\n")),
    )
}

fn blob(ctx: &BuildContext<'_>, name: String, key: &str, content: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(key.to_string(), content)])),
        ..ConfigMap::default()
    }
}
