//! Migration of cluster, project and global role bindings.

use tracing::error;
use tracing::info;

use super::swap::carried_over;
use super::swap::replacement_metadata;
use super::swap::swap;
use super::swap::MigrateObject;
use super::MIGRATE_CRTBS_OPERATION;
use super::MIGRATE_GRBS_OPERATION;
use super::MIGRATE_PRTBS_OPERATION;
use super::MIGRATION_ANNOTATION;
use super::MIGRATION_LABEL;
use super::PREVIOUS_NAME_LABEL;
use crate::backoff::Backoff;
use crate::collect::BoundToUser;
use crate::identify::MigrateUserWorkUnit;
use crate::k8s::ManageResources;
use crate::resources::ClusterRoleTemplateBinding;
use crate::resources::GlobalRoleBinding;
use crate::resources::ProjectRoleTemplateBinding;

/// A binding granting a role template to a user identified by name and principal.
pub trait RoleTemplateBinding: MigrateObject + BoundToUser {
    /// A copy of the binding granting the same role to `user_name` as `principal_id`.
    fn rebound(&self, user_name: &str, principal_id: &str) -> Self;
}

impl MigrateObject for ClusterRoleTemplateBinding {
    const OPERATION: &'static str = MIGRATE_CRTBS_OPERATION;
    const GENERATE_NAME: &'static str = "crtb-";

    fn previous_principal(&self) -> Option<&str> {
        Some(&self.user_principal_name)
    }
}

impl RoleTemplateBinding for ClusterRoleTemplateBinding {
    fn rebound(&self, user_name: &str, principal_id: &str) -> Self {
        ClusterRoleTemplateBinding {
            types: None,
            metadata: replacement_metadata(self),
            cluster_name: self.cluster_name.clone(),
            user_name: user_name.to_owned(),
            user_principal_name: principal_id.to_owned(),
            role_template_name: self.role_template_name.clone(),
            extra: carried_over(&self.extra),
        }
    }
}

impl MigrateObject for ProjectRoleTemplateBinding {
    const OPERATION: &'static str = MIGRATE_PRTBS_OPERATION;
    const GENERATE_NAME: &'static str = "prtb-";

    fn previous_principal(&self) -> Option<&str> {
        Some(&self.user_principal_name)
    }
}

impl RoleTemplateBinding for ProjectRoleTemplateBinding {
    fn rebound(&self, user_name: &str, principal_id: &str) -> Self {
        ProjectRoleTemplateBinding {
            types: None,
            metadata: replacement_metadata(self),
            project_name: self.project_name.clone(),
            user_name: user_name.to_owned(),
            user_principal_name: principal_id.to_owned(),
            role_template_name: self.role_template_name.clone(),
            extra: carried_over(&self.extra),
        }
    }
}

impl MigrateObject for GlobalRoleBinding {
    const OPERATION: &'static str = MIGRATE_GRBS_OPERATION;
    const GENERATE_NAME: &'static str = "grb-";

    fn previous_principal(&self) -> Option<&str> {
        None
    }
}

/// Moves role template bindings of a work unit to its DN-based principal, and bindings of duplicate users
/// to the original user.
///
/// Failures are logged per binding and never stop the migration of the user.
pub async fn migrate_bindings<B: RoleTemplateBinding>(
    api: &impl ManageResources,
    backoff: &Backoff,
    unit: &MigrateUserWorkUnit,
    active_directory: &[B],
    duplicate_local: &[B],
    dry_run: bool,
) {
    let user_name = unit.original_user.name();

    let dn_principal = unit.dn_principal();
    for old in active_directory {
        let name = old.metadata().name.as_deref().unwrap_or_default();
        if dry_run {
            info!(
                operation = B::OPERATION,
                "DRY RUN: would migrate {} '{name}' from GUID principal '{}' to DN principal '{dn_principal}'. \
                 Annotation {MIGRATION_ANNOTATION} and labels {PREVIOUS_NAME_LABEL} and {MIGRATION_LABEL} would be added",
                B::KIND,
                old.user_principal_name(),
            );
            continue;
        }
        if let Err(e) = swap(api, backoff, old, old.rebound(user_name, &dn_principal)).await {
            error!(operation = B::OPERATION, user = %user_name, error = %e, "error while migrating {} '{name}'", B::KIND);
        }
    }

    let local_principal = unit.original_local_principal();
    for old in duplicate_local {
        let name = old.metadata().name.as_deref().unwrap_or_default();
        if dry_run {
            info!(
                operation = B::OPERATION,
                "DRY RUN: would migrate {} '{name}' from duplicate local user '{}' to original user '{local_principal}'. \
                 Annotation {MIGRATION_ANNOTATION} and labels {PREVIOUS_NAME_LABEL} and {MIGRATION_LABEL} would be added",
                B::KIND,
                old.user_principal_name(),
            );
            continue;
        }
        if let Err(e) = swap(api, backoff, old, old.rebound(user_name, &local_principal)).await {
            error!(operation = B::OPERATION, user = %user_name, error = %e, "error while migrating {} '{name}'", B::KIND);
        }
    }
}

/// Moves the global role bindings of duplicate users to the original user.
pub async fn migrate_grbs(api: &impl ManageResources, backoff: &Backoff, unit: &MigrateUserWorkUnit, dry_run: bool) {
    let user_name = unit.original_user.name();

    for old in &unit.duplicate_local_grbs {
        let name = old.metadata.name.as_deref().unwrap_or_default();
        if dry_run {
            info!(
                operation = MIGRATE_GRBS_OPERATION,
                "DRY RUN: would migrate GRB '{name}' from duplicate local user '{}' to original user '{user_name}'. \
                 Labels {PREVIOUS_NAME_LABEL} and {MIGRATION_LABEL} would be added",
                old.user_name,
            );
            continue;
        }

        let replacement = GlobalRoleBinding {
            types: None,
            metadata: replacement_metadata(old),
            global_role_name: old.global_role_name.clone(),
            user_name: user_name.to_owned(),
            group_principal_name: old.group_principal_name.clone(),
            extra: carried_over(&old.extra),
        };
        if let Err(e) = swap(api, backoff, old, replacement).await {
            error!(operation = MIGRATE_GRBS_OPERATION, user = %user_name, error = %e, "error while migrating GRB '{name}'");
        }
    }
}
