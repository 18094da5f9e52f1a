//! Replacing an object by a migrated copy.
//!
//! Bindings and tokens cannot be edited in place: Rancher only re-syncs the RBAC rules of a binding when
//! it is created or deleted. An object is therefore migrated in three steps:
//!
//! 1. create a copy pointing at the new user, labelled with the name of the object it replaces,
//! 2. delete the original,
//! 3. annotate the copy with the principal of the original, which triggers the final sync.
//!
//! Every step is retried while the api server reports internal errors, which is how an overloaded
//! admission webhook shows up.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tracing::debug;

use super::MIGRATED_LABEL_VALUE;
use super::MIGRATION_ANNOTATION;
use super::MIGRATION_LABEL;
use super::PREVIOUS_NAME_LABEL;
use crate::backoff::retry_with_backoff;
use crate::backoff::Backoff;
use crate::error::Error;
use crate::error::Result;
use crate::k8s::ManageResources;
use crate::resources::KubeObject;
use crate::TryResource;

/// Top level fields owned by the api server. They are not copied to a replacement.
const SERVER_OWNED_FIELDS: [&str; 1] = ["status"];

/// An object that is migrated by creating a copy and deleting the original.
pub trait MigrateObject: KubeObject {
    /// Value of the `operation` field of log events.
    const OPERATION: &'static str;
    /// Prefix of the generated name of the copy.
    const GENERATE_NAME: &'static str;

    /// The principal the object pointed at, recorded on the copy once the original is gone. `None` for
    /// kinds that reference users by name only.
    fn previous_principal(&self) -> Option<&str>;
}

/// Metadata of the copy of `old`: same namespace, labels and annotations, plus the migration labels.
pub fn replacement_metadata<R: MigrateObject>(old: &R) -> ObjectMeta {
    let meta = old.metadata();

    let mut labels = meta.labels.clone().unwrap_or_default();
    labels.insert(
        PREVIOUS_NAME_LABEL.to_owned(),
        meta.name.clone().unwrap_or_default(),
    );
    labels.insert(MIGRATION_LABEL.to_owned(), MIGRATED_LABEL_VALUE.to_owned());

    // The migration annotation is set last, see `swap`.
    let annotations = meta
        .annotations
        .clone()
        .map(|mut annotations| {
            annotations.remove(MIGRATION_ANNOTATION);
            annotations
        })
        .filter(|annotations| !annotations.is_empty());

    ObjectMeta {
        generate_name: Some(R::GENERATE_NAME.to_owned()),
        namespace: meta.namespace.clone(),
        labels: Some(labels),
        annotations,
        ..Default::default()
    }
}

/// The unknown fields of an object that are sent along with its copy.
pub fn carried_over(extra: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    extra
        .iter()
        .filter(|(key, _)| !SERVER_OWNED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Replaces `old` by `replacement` and returns the created copy.
///
/// Fails as soon as one of the steps fails for good. If creating the copy fails, the original is left
/// untouched.
pub async fn swap<R: MigrateObject>(
    api: &impl ManageResources,
    backoff: &Backoff,
    old: &R,
    replacement: R,
) -> Result<R> {
    let old_name = old.try_name()?;
    let namespace = old.metadata().namespace.as_deref();

    let created = retry_with_backoff(
        backoff,
        &format!("create {}", R::KIND),
        Error::is_internal,
        || api.create(&replacement),
    )
    .await?;
    let created_name = created.try_name()?;
    debug!(operation = R::OPERATION, old = %old_name, new = %created_name, "created replacement {}", R::KIND);

    retry_with_backoff(
        backoff,
        &format!("delete {} {old_name}", R::KIND),
        Error::is_internal,
        || async move {
            match api.delete::<R>(namespace, old_name).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        },
    )
    .await?;

    let Some(previous_principal) = old.previous_principal() else {
        return Ok(created);
    };
    let annotations = BTreeMap::from([(
        MIGRATION_ANNOTATION.to_owned(),
        previous_principal.to_owned(),
    )]);
    retry_with_backoff(
        backoff,
        &format!("annotate {} {created_name}", R::KIND),
        Error::is_internal,
        || api.annotate::<R>(namespace, created_name, &annotations),
    )
    .await
}
