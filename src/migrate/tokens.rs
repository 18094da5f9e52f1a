//! Migration of login tokens.

use tracing::error;
use tracing::info;

use super::swap::carried_over;
use super::swap::replacement_metadata;
use super::swap::swap;
use super::swap::MigrateObject;
use super::MIGRATE_TOKENS_OPERATION;
use super::TOKEN_USER_ID_LABEL;
use crate::backoff::Backoff;
use crate::identify::MigrateUserWorkUnit;
use crate::k8s::ManageResources;
use crate::principal::is_active_directory_principal;
use crate::resources::Principal;
use crate::resources::Token;

impl MigrateObject for Token {
    const OPERATION: &'static str = MIGRATE_TOKENS_OPERATION;
    const GENERATE_NAME: &'static str = "token-";

    fn previous_principal(&self) -> Option<&str> {
        Some(self.user_principal.id())
    }
}

/// A copy of `old` issued to `user_name` for the principal `principal`.
fn reissued(old: &Token, user_name: &str, principal: Principal) -> Token {
    let mut metadata = replacement_metadata(old);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.insert(TOKEN_USER_ID_LABEL.to_owned(), user_name.to_owned());
    }

    Token {
        types: None,
        metadata,
        token: old.token.clone(),
        user_principal: principal,
        user_id: user_name.to_owned(),
        auth_provider: old.auth_provider.clone(),
        extra: carried_over(&old.extra),
    }
}

/// The principal of an Active Directory token once the user is known by its DN.
fn dn_principal(old: &Principal, unit: &MigrateUserWorkUnit) -> Principal {
    let mut principal = old.clone();
    principal.metadata.name = Some(unit.dn_principal());
    if !unit.principal.display_name.is_empty() {
        principal.display_name = unit.principal.display_name.clone();
    }
    if !unit.principal.login_name.is_empty() {
        principal.login_name = unit.principal.login_name.clone();
    }
    principal
}

/// The principal of a token of a duplicate user once it belongs to the original user.
fn original_user_principal(old: &Principal, unit: &MigrateUserWorkUnit) -> Principal {
    if is_active_directory_principal(old.id()) {
        return dn_principal(old, unit);
    }
    let mut principal = old.clone();
    principal.metadata.name = Some(unit.original_local_principal());
    principal
}

/// Moves tokens issued for the GUID-based principal to the DN-based principal, and tokens of duplicate
/// users to the original user.
pub async fn migrate_tokens(api: &impl ManageResources, backoff: &Backoff, unit: &MigrateUserWorkUnit, dry_run: bool) {
    let user_name = unit.original_user.name();

    for old in &unit.active_directory_tokens {
        let name = old.metadata.name.as_deref().unwrap_or_default();
        if dry_run {
            info!(
                operation = MIGRATE_TOKENS_OPERATION,
                "DRY RUN: would migrate token '{name}' from GUID principal '{}' to DN principal '{}'",
                old.user_principal.id(),
                unit.dn_principal(),
            );
            continue;
        }
        let replacement = reissued(old, user_name, dn_principal(&old.user_principal, unit));
        if let Err(e) = swap(api, backoff, old, replacement).await {
            error!(operation = MIGRATE_TOKENS_OPERATION, user = %user_name, error = %e, "error while migrating token '{name}'");
        }
    }

    for old in &unit.duplicate_local_tokens {
        let name = old.metadata.name.as_deref().unwrap_or_default();
        if dry_run {
            info!(
                operation = MIGRATE_TOKENS_OPERATION,
                "DRY RUN: would migrate token '{name}' from duplicate local user '{}' to original user '{user_name}'",
                old.user_id,
            );
            continue;
        }
        let replacement = reissued(old, user_name, original_user_principal(&old.user_principal, unit));
        if let Err(e) = swap(api, backoff, old, replacement).await {
            error!(operation = MIGRATE_TOKENS_OPERATION, user = %user_name, error = %e, "error while migrating token '{name}'");
        }
    }
}
