//! JSON-merge status patch, lifted from `storage_operator::util::patch`:
//! clone, mutate the status in place, diff against the original, apply as a
//! server-side-apply status patch.

use guildnet_types::{Workspace, WorkspaceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "guildnet-hostapp";

pub async fn patch_status(
    client: Client,
    instance: &Workspace,
    f: impl FnOnce(&mut WorkspaceStatus),
) -> Result<Workspace> {
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::Internal(format!("workspace {name} has no namespace")))?;

    let mut modified = instance.clone();
    let status = modified.status.get_or_insert_with(Default::default);
    f(status);
    status.last_updated = Some(Time(k8s_openapi::jiff::Timestamp::now()));

    let patch = Patch::Json::<Workspace>(json_patch::diff(
        &serde_json::to_value(instance)?,
        &serde_json::to_value(&modified)?,
    ));

    let api: Api<Workspace> = Api::namespaced(client, &namespace);
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &patch)
        .await
        .map_err(Error::Kube)
}
