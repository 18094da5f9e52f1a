//! Updating the kept user and removing its duplicates.

use tracing::debug;
use tracing::error;
use tracing::info;

use super::MIGRATED_LABEL_VALUE;
use super::MIGRATE_AD_USER_OPERATION;
use super::MIGRATION_ANNOTATION;
use super::MIGRATION_LABEL;
use crate::backoff::retry_with_backoff;
use crate::backoff::Backoff;
use crate::error::Error;
use crate::error::Result;
use crate::identify::MigrateUserWorkUnit;
use crate::k8s::ManageResources;
use crate::principal::active_directory_principal;
use crate::principal::is_active_directory_principal;
use crate::resources::User;

/// Replaces every Active Directory principal of `user` with the DN-based one. Other principals are kept.
pub fn replace_guid_principal_with_dn(user: &mut User, dn: &str, guid: &str, dry_run: bool) {
    let dn_principal = active_directory_principal(dn);
    if dry_run {
        info!(
            operation = MIGRATE_AD_USER_OPERATION,
            "DRY RUN: would replace principal '{}' of user '{}' with '{dn_principal}'",
            active_directory_principal(guid),
            user.name(),
        );
    } else {
        debug!(operation = MIGRATE_AD_USER_OPERATION, user = %user.name(), guid = %guid, "replacing GUID principal with '{dn_principal}'");
    }

    user.principal_ids.retain(|id| !is_active_directory_principal(id));
    user.principal_ids.push(dn_principal);
}

/// Deletes a user. A user that is already gone counts as deleted.
pub async fn delete_user(api: &impl ManageResources, backoff: &Backoff, name: &str) -> Result<()> {
    retry_with_backoff(backoff, &format!("delete user {name}"), Error::is_internal, || async move {
        match api.delete::<User>(None, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    })
    .await
}

/// Deletes the duplicate users of a work unit. Stops at the first user that cannot be deleted, so the
/// original user is not updated while another user still holds the same principal.
pub async fn delete_duplicate_users(api: &impl ManageResources, backoff: &Backoff, unit: &MigrateUserWorkUnit) -> Result<()> {
    for duplicate in &unit.duplicate_users {
        info!(
            operation = MIGRATE_AD_USER_OPERATION,
            user = %duplicate.name(),
            "deleting duplicate of user '{}'",
            unit.original_user.name()
        );
        delete_user(api, backoff, duplicate.name())
            .await
            .inspect_err(|e| {
                error!(operation = MIGRATE_AD_USER_OPERATION, user = %duplicate.name(), error = %e, "failed to delete duplicate user")
            })?;
    }
    Ok(())
}

/// Saves the principals of the original user of a work unit and marks it as migrated.
///
/// The user is read again right before saving, so only the principals, the migration label and the
/// migration annotation are changed.
pub async fn update_modified_user(api: &impl ManageResources, backoff: &Backoff, unit: &MigrateUserWorkUnit) -> Result<User> {
    let name = unit.original_user.name();
    let principal_ids = &unit.original_user.principal_ids;
    let guid = unit.guid.as_str();

    retry_with_backoff(backoff, &format!("update user {name}"), Error::is_internal, || async move {
        let mut user: User = api.get(None, name).await?;
        user.principal_ids = principal_ids.clone();
        user.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(MIGRATION_ANNOTATION.to_owned(), guid.to_owned());
        user.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(MIGRATION_LABEL.to_owned(), MIGRATED_LABEL_VALUE.to_owned());
        api.replace(&user).await
    })
    .await
    .inspect_err(|e| error!(operation = MIGRATE_AD_USER_OPERATION, user = %name, error = %e, "failed to save migrated user"))
}

/// Logs what a real run would do for the work unit.
pub fn describe_planned_changes(unit: &MigrateUserWorkUnit) {
    let name = unit.original_user.name();
    info!(
        operation = MIGRATE_AD_USER_OPERATION,
        "DRY RUN: changes to user '{name}' have not been saved. principals would become {:?}",
        unit.original_user.principal_ids,
    );
    for duplicate in &unit.duplicate_users {
        info!(
            operation = MIGRATE_AD_USER_OPERATION,
            "DRY RUN: duplicate user '{}' would be merged into '{name}' and deleted",
            duplicate.name(),
        );
    }
    info!(
        operation = MIGRATE_AD_USER_OPERATION,
        "DRY RUN: user '{name}' would be labelled {MIGRATION_LABEL}={MIGRATED_LABEL_VALUE} and annotated {MIGRATION_ANNOTATION}={}",
        unit.guid,
    );
}
