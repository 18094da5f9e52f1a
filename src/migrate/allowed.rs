//! Rewrites the list of principals allowed to log in through Active Directory.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;

use super::MIGRATE_AD_USER_OPERATION;
use crate::backoff::retry_with_backoff;
use crate::backoff::Backoff;
use crate::config::MigrationOptions;
use crate::directory::LookupUser;
use crate::error::Error;
use crate::error::Result;
use crate::identify::WorkUnits;
use crate::k8s::ManageResources;
use crate::principal::active_directory_principal;
use crate::principal::external_id;
use crate::principal::is_guid;
use crate::principal::scope;
use crate::principal::ACTIVE_DIRECTORY_PROVIDER;
use crate::principal::ACTIVE_DIRECTORY_SCOPE;
use crate::resources::AuthConfig;

pub const ALLOWED_PRINCIPALS_FIELD: &str = "allowedPrincipalIds";

/// Reads the allowed principal IDs of an auth config. `None` if the list is not set.
pub fn allowed_principal_ids(auth_config: &AuthConfig) -> Result<Option<Vec<String>>> {
    match auth_config.data.get(ALLOWED_PRINCIPALS_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(principal_id) => Ok(principal_id.clone()),
                other => Err(Error::InvalidConfig(format!(
                    "expected string for allowed principal id, found instead {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => Err(Error::InvalidConfig(format!(
            "expected list for allowed principal ids, got {other}"
        ))),
    }
}

/// Computes the new allowed principal list.
///
/// Entries that are not Active Directory principals, or cannot be parsed, are kept as they are. GUID-based
/// entries are replaced by the DN-based principal of their user, resolving unknown GUIDs through
/// `directory` unless `directory_failed` is set. Entries of users missing from the directory are dropped
/// when `delete_missing` is set. DN-based entries are deduplicated and appended in sorted order.
pub async fn reconcile_allowed_principals(
    principal_ids: &[String],
    work_units: &WorkUnits,
    directory: &impl LookupUser,
    delete_missing: bool,
) -> Vec<String> {
    let migrated: HashMap<String, &str> = work_units
        .to_migrate
        .iter()
        .map(|unit| (unit.guid_principal(), unit.distinguished_name.as_str()))
        .collect();
    let missing: HashSet<String> = work_units
        .missing
        .iter()
        .map(|unit| active_directory_principal(&unit.guid))
        .collect();

    let mut kept = Vec::new();
    let mut distinguished_names = BTreeSet::new();

    for principal_id in principal_ids {
        match scope(principal_id) {
            Err(e) => {
                error!(operation = MIGRATE_AD_USER_OPERATION, error = %e, "found invalid principal ID in allowed user list, refusing to process");
                kept.push(principal_id.clone());
                continue;
            }
            Ok(scope) if scope != ACTIVE_DIRECTORY_SCOPE => {
                kept.push(principal_id.clone());
                continue;
            }
            Ok(_) => {}
        }

        if !is_guid(principal_id) {
            distinguished_names.insert(principal_id.clone());
        } else if let Some(dn) = migrated.get(principal_id) {
            distinguished_names.insert(active_directory_principal(dn));
        } else if missing.contains(principal_id) {
            if !delete_missing {
                kept.push(principal_id.clone());
            }
        } else if work_units.directory_failed {
            debug!(operation = MIGRATE_AD_USER_OPERATION, principal = %principal_id, "directory unavailable, keeping allowed principal as it is");
            kept.push(principal_id.clone());
        } else {
            let guid = external_id(principal_id).unwrap_or_default();
            match directory.find_user_with_retries(guid).await {
                Ok((dn, _)) => {
                    distinguished_names.insert(active_directory_principal(&dn));
                }
                Err(Error::LdapNotFound) => {
                    if !delete_missing {
                        kept.push(principal_id.clone());
                    }
                }
                Err(e) => {
                    error!(operation = MIGRATE_AD_USER_OPERATION, principal = %principal_id, error = %e, "ldap error when checking distinguished name for guid-based principal, skipping");
                    kept.push(principal_id.clone());
                }
            }
        }
    }

    kept.extend(distinguished_names);
    kept
}

/// Rewrites `allowedPrincipalIds` of the Active Directory auth config to DN-based principals.
#[instrument(skip_all, fields(operation = MIGRATE_AD_USER_OPERATION))]
pub async fn migrate_allowed_principals(
    api: &impl ManageResources,
    directory: &impl LookupUser,
    backoff: &Backoff,
    work_units: &WorkUnits,
    options: MigrationOptions,
) -> Result<()> {
    let mut auth_config: AuthConfig = api.get(None, ACTIVE_DIRECTORY_PROVIDER).await?;
    let Some(principal_ids) = allowed_principal_ids(&auth_config)? else {
        debug!("no allowed principals configured, nothing to migrate");
        return Ok(());
    };

    let principal_ids =
        reconcile_allowed_principals(&principal_ids, work_units, directory, options.delete_missing_users).await;
    directory.close().await;

    if options.dry_run {
        info!("DRY RUN: new allowed user list will contain these principal IDs:");
        for principal_id in &principal_ids {
            info!("DRY RUN:   '{principal_id}'");
        }
        return Ok(());
    }

    auth_config.data.insert(
        ALLOWED_PRINCIPALS_FIELD.to_owned(),
        Value::from(principal_ids),
    );
    retry_with_backoff(backoff, "update allowed principals", Error::is_internal, || {
        api.replace(&auth_config)
    })
    .await?;
    Ok(())
}
