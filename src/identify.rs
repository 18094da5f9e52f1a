//! Work-Unit Classifier: sorts users into work units.
//!
//! Users are identified in two passes over the full user list:
//!
//! 1. GUID-based users are looked up in the directory and end up in [`WorkUnits::to_migrate`],
//!    [`WorkUnits::missing`] or [`WorkUnits::skipped`]. Users sharing a GUID are merged into one work unit.
//! 2. DN-based users whose DN was found in the first pass are merged into that work unit as duplicates.
//!
//! Within a work unit the oldest user is kept as the original user; all others are duplicates that get
//! deleted once their bindings and tokens point at the original user.

use std::collections::HashMap;
use std::mem;

use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::directory::LookupUser;
use crate::error::Error;
use crate::principal::active_directory_principal;
use crate::principal::ad_principal_id;
use crate::principal::external_id;
use crate::principal::is_guid;
use crate::principal::local_principal;
use crate::principal::IDENTIFY_AD_USER_OPERATION;
use crate::resources::ClusterRoleTemplateBinding;
use crate::resources::GlobalRoleBinding;
use crate::resources::Principal;
use crate::resources::ProjectRoleTemplateBinding;
use crate::resources::Token;
use crate::resources::User;

/// A directory identity whose users end up as one user with a DN-based principal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrateUserWorkUnit {
    pub guid: String,
    pub distinguished_name: String,
    /// The oldest user of the identity. It is kept.
    pub original_user: User,
    /// All other users of the identity. They are deleted.
    pub duplicate_users: Vec<User>,
    /// The principal as reported by the directory.
    pub principal: Principal,

    pub active_directory_crtbs: Vec<ClusterRoleTemplateBinding>,
    pub duplicate_local_crtbs: Vec<ClusterRoleTemplateBinding>,

    pub active_directory_prtbs: Vec<ProjectRoleTemplateBinding>,
    pub duplicate_local_prtbs: Vec<ProjectRoleTemplateBinding>,

    pub duplicate_local_grbs: Vec<GlobalRoleBinding>,

    pub active_directory_tokens: Vec<Token>,
    pub duplicate_local_tokens: Vec<Token>,
}

impl MigrateUserWorkUnit {
    fn new(guid: String, distinguished_name: String, principal: Principal, user: User) -> Self {
        MigrateUserWorkUnit {
            guid,
            distinguished_name,
            original_user: user,
            principal,
            ..Default::default()
        }
    }

    /// Whether `name` is the original user or one of its duplicates.
    pub fn contains_name(&self, name: &str) -> bool {
        self.original_user.name() == name || self.duplicate_users.iter().any(|user| user.name() == name)
    }

    pub fn guid_principal(&self) -> String {
        active_directory_principal(&self.guid)
    }

    pub fn dn_principal(&self) -> String {
        active_directory_principal(&self.distinguished_name)
    }

    pub fn original_local_principal(&self) -> String {
        local_principal(self.original_user.name())
    }

    /// Adds `user` to the work unit. If it is older than the current original user, it takes its place.
    fn merge_duplicate(&mut self, user: User) {
        if is_older(&user, &self.original_user) {
            let previous = mem::replace(&mut self.original_user, user);
            self.duplicate_users.push(previous);
        } else {
            self.duplicate_users.push(user);
        }
    }
}

/// A GUID-based user the directory does not know anymore.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MissingUserWorkUnit {
    pub guid: String,
    pub original_user: User,
    pub duplicate_users: Vec<User>,
}

/// A GUID-based user that could not be looked up.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkippedUserWorkUnit {
    pub guid: String,
    pub original_user: User,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkUnits {
    pub to_migrate: Vec<MigrateUserWorkUnit>,
    pub missing: Vec<MissingUserWorkUnit>,
    pub skipped: Vec<SkippedUserWorkUnit>,
    /// Set once the directory could not be reached within the retry budget.
    pub directory_failed: bool,
}

/// Strictly earlier creation wins; a user without creation timestamp counts as the oldest.
fn is_older(candidate: &User, current: &User) -> bool {
    current.created() > candidate.created()
}

/// Sorts `users` into work units, looking up GUID-based users in `directory`.
///
/// The directory session is closed after the first pass.
#[instrument(skip_all, fields(operation = IDENTIFY_AD_USER_OPERATION, users = users.len()))]
pub async fn identify_migration_work_units(users: &[User], directory: &impl LookupUser) -> WorkUnits {
    let mut units = WorkUnits::default();

    // Indices into the vectors of `units`, keyed by GUID or DN.
    let mut known_guid_units: HashMap<String, usize> = HashMap::new();
    let mut known_guid_missing: HashMap<String, usize> = HashMap::new();
    let mut known_dn_units: HashMap<String, usize> = HashMap::new();

    debug!("locating GUID-based Active Directory users");
    for user in users {
        let Some(principal_id) = ad_principal_id(user) else {
            debug!(user = %user.name(), "user has no AD principals, skipping");
            continue;
        };
        if !is_guid(principal_id) {
            debug!(principal = %principal_id, "not a GUID-based principal ID, taking no action");
            continue;
        }
        let guid = match external_id(principal_id) {
            Ok(guid) => guid.to_owned(),
            Err(e) => {
                error!(user = %user.name(), error = %e, "failed to extract GUID from principal, cannot process user");
                continue;
            }
        };

        if units.directory_failed {
            units.skipped.push(SkippedUserWorkUnit {
                guid,
                original_user: user.clone(),
            });
            continue;
        }

        if let Some(&i) = known_guid_units.get(&guid) {
            let unit = &mut units.to_migrate[i];
            debug!(user = %user.name(), guid = %guid, original = %unit.original_user.name(), "GUID-based duplicate user");
            unit.merge_duplicate(user.clone());
            continue;
        }

        if let Some(&i) = known_guid_missing.get(&guid) {
            let unit = &mut units.missing[i];
            debug!(user = %user.name(), guid = %guid, original = %unit.original_user.name(), "duplicate of a missing user");
            unit.duplicate_users.push(user.clone());
            continue;
        }

        match directory.find_user_with_retries(&guid).await {
            Ok((dn, principal)) => {
                debug!(user = %user.name(), guid = %guid, dn = %dn, "Active Directory knows the user by its distinguished name");
                known_guid_units.insert(guid.clone(), units.to_migrate.len());
                known_dn_units.insert(dn.clone(), units.to_migrate.len());
                units
                    .to_migrate
                    .push(MigrateUserWorkUnit::new(guid, dn, principal, user.clone()));
            }
            Err(Error::LdapNotFound) => {
                debug!(user = %user.name(), guid = %guid, "Active Directory does not know the user, marking it as missing");
                known_guid_missing.insert(guid.clone(), units.missing.len());
                units.missing.push(MissingUserWorkUnit {
                    guid,
                    original_user: user.clone(),
                    duplicate_users: Vec::new(),
                });
            }
            Err(Error::LdapConnectionPermanentlyFailed) => {
                warn!("LDAP connection has permanently failed! will continue to migrate previously identified users");
                units.directory_failed = true;
                units.skipped.push(SkippedUserWorkUnit {
                    guid,
                    original_user: user.clone(),
                });
            }
            Err(Error::LdapDuplicateGuid) => {
                error!(guid = %guid, "LDAP returned multiple users for one GUID, this may indicate a configuration error! the user will be skipped");
                units.skipped.push(SkippedUserWorkUnit {
                    guid,
                    original_user: user.clone(),
                });
            }
            Err(e) => {
                error!(user = %user.name(), guid = %guid, error = %e, "unable to look up user, it will be skipped");
                units.skipped.push(SkippedUserWorkUnit {
                    guid,
                    original_user: user.clone(),
                });
            }
        }
    }

    directory.close().await;

    if units.to_migrate.is_empty() {
        debug!("found 0 users in need of migration, not checking for DN-based duplicates");
        return units;
    }

    debug!("locating DN-based Active Directory users");
    for user in users {
        let Some(principal_id) = ad_principal_id(user) else {
            continue;
        };
        if is_guid(principal_id) {
            continue;
        }
        let dn = match external_id(principal_id) {
            Ok(dn) => dn,
            Err(e) => {
                error!(user = %user.name(), error = %e, "failed to extract DN from principal, cannot process user");
                continue;
            }
        };

        if let Some(&i) = known_dn_units.get(dn) {
            let unit = &mut units.to_migrate[i];
            debug!(user = %user.name(), dn = %dn, original = %unit.original_user.name(), "DN-based duplicate user");
            unit.merge_duplicate(user.clone());
        }
    }

    units
}
