//! Resource Migrator and the entry points of a migration run.
//!
//! [`Migration::run`] drives a whole run: it checks and records the status, identifies the work units,
//! collects their bindings and tokens, migrates one work unit after the other and finally rewrites the
//! allowed principal list. The final phase is recorded on every way out of the run, panics included.

mod allowed;
mod bindings;
mod swap;
mod tokens;
mod users;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use kube::Client;
use tracing::error;
use tracing::info;
use tracing::instrument;

pub use self::allowed::allowed_principal_ids;
pub use self::allowed::migrate_allowed_principals;
pub use self::allowed::reconcile_allowed_principals;
pub use self::bindings::migrate_bindings;
pub use self::bindings::migrate_grbs;
pub use self::bindings::RoleTemplateBinding;
pub use self::swap::swap;
pub use self::swap::MigrateObject;
pub use self::tokens::migrate_tokens;
pub use self::users::delete_duplicate_users;
pub use self::users::delete_user;
pub use self::users::describe_planned_changes;
pub use self::users::replace_guid_principal_with_dn;
pub use self::users::update_modified_user;
use crate::backoff::Backoff;
use crate::collect::collect_dependent_resources;
use crate::config::load_active_directory_config;
use crate::config::MigrationOptions;
use crate::directory::LookupUser;
use crate::directory::SharedConnection;
use crate::error::Result;
use crate::identify::identify_migration_work_units;
use crate::identify::MigrateUserWorkUnit;
use crate::identify::MissingUserWorkUnit;
use crate::k8s::K8sRepository;
use crate::k8s::ManageResources;
use crate::resources::User;
use crate::status::MigrationPhase;
use crate::status::StatusTracker;
use crate::status::UserList;

pub(crate) const MIGRATE_AD_USER_OPERATION: &str = "migrate-ad-user";
pub(crate) const MIGRATE_TOKENS_OPERATION: &str = "migrate-ad-tokens";
pub(crate) const MIGRATE_CRTBS_OPERATION: &str = "migrate-ad-crtbs";
pub(crate) const MIGRATE_PRTBS_OPERATION: &str = "migrate-ad-prtbs";
pub(crate) const MIGRATE_GRBS_OPERATION: &str = "migrate-ad-grbs";

/// Set to [`MIGRATED_LABEL_VALUE`] on every migrated user and every replacement object.
pub const MIGRATION_LABEL: &str = "ad-guid-migration";
pub const MIGRATED_LABEL_VALUE: &str = "migrated";
/// Name of the object a replacement took the place of.
pub const PREVIOUS_NAME_LABEL: &str = "ad-guid-previous-name";
/// The previous principal on replacement objects, the GUID on migrated users.
pub const MIGRATION_ANNOTATION: &str = "ad-guid-migration-data";
pub const TOKEN_USER_ID_LABEL: &str = "authn.management.cattle.io/token-userId";

/// Migrates all GUID-based Active Directory users of the cluster to DN-based principals.
///
/// Returns without doing anything while another run is recorded as running.
pub async fn unmigrate_ad_guid_users(config: kube::Config, options: MigrationOptions) -> Result<()> {
    let api = K8sRepository::new(Client::try_from(config)?);
    run_with_directory(&api, options).await
}

/// Like [`unmigrate_ad_guid_users`] with default options, but only if no run has finished before. Meant to
/// be called at startup.
pub async fn unmigrate_ad_guid_users_once(config: kube::Config) -> Result<()> {
    let api = K8sRepository::new(Client::try_from(config)?);
    if !StatusTracker::new(&api).may_start_once().await {
        return Ok(());
    }
    run_with_directory(&api, MigrationOptions::default()).await
}

async fn run_with_directory(api: &K8sRepository, options: MigrationOptions) -> Result<()> {
    let config = load_active_directory_config(api).await?;
    let enabled = config.enabled;
    let directory = SharedConnection::ldap(config);
    Migration::new(api, &directory, enabled, options).run().await
}

/// A single migration run against a cluster and a directory.
pub struct Migration<'a, M, L> {
    api: &'a M,
    directory: &'a L,
    /// Whether the Active Directory provider is enabled.
    enabled: bool,
    options: MigrationOptions,
    backoff: Backoff,
}

impl<'a, M: ManageResources, L: LookupUser> Migration<'a, M, L> {
    pub fn new(api: &'a M, directory: &'a L, enabled: bool, options: MigrationOptions) -> Self {
        Migration {
            api,
            directory,
            enabled,
            options: options.normalized(),
            backoff: Backoff::api(),
        }
    }

    /// Overrides the backoff used for api writes.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[instrument(skip_all, fields(operation = MIGRATE_AD_USER_OPERATION, dry_run = self.options.dry_run))]
    pub async fn run(&self) -> Result<()> {
        if self.options.dry_run {
            info!("dryRun is true, no objects will be deleted/modified");
        } else if self.options.delete_missing_users {
            info!("deleteMissingUsers is true, GUID-based users not present in Active Directory will be deleted");
        }

        let status = StatusTracker::new(self.api).with_backoff(self.backoff.clone());
        if !status.may_start().await {
            return Ok(());
        }

        if !self.options.dry_run {
            if let Err(e) = status.set_phase(MigrationPhase::Running).await {
                error!(error = %e, "unable to update migration status configmap");
                self.finish(&status, MigrationPhase::Failed).await;
                return Err(e);
            }
            for list in [UserList::Skipped, UserList::Missing] {
                if let Err(e) = status.reset_user_list(list).await {
                    error!(error = %e, "unable to reset {list} in migration status configmap");
                }
            }
        }

        // A run that stops while recorded as running blocks every following run.
        let (phase, result) = match AssertUnwindSafe(self.migrate(&status)).catch_unwind().await {
            Ok(Ok(phase)) => (phase, Ok(())),
            Ok(Err(e)) => {
                error!(error = %e, "migration failed");
                (MigrationPhase::Failed, Err(e))
            }
            Err(panic) => {
                self.finish(&status, MigrationPhase::Failed).await;
                std::panic::resume_unwind(panic);
            }
        };
        self.finish(&status, phase).await;
        result
    }

    async fn finish(&self, status: &StatusTracker<'_, M>, phase: MigrationPhase) {
        if self.options.dry_run {
            info!("DRY RUN: migration would finish with status {phase}");
            return;
        }
        if let Err(e) = status.set_phase(phase).await {
            error!(error = %e, "unable to update migration status configmap");
        }
    }

    /// The body of a run. Returns the phase to record.
    async fn migrate(&self, status: &StatusTracker<'_, M>) -> Result<MigrationPhase> {
        if !self.enabled {
            info!("during unmigration, found that Active Directory is not enabled. nothing to do");
            return Ok(MigrationPhase::Finished);
        }

        let users: Vec<User> = self
            .api
            .list()
            .await
            .inspect_err(|e| error!(error = %e, "unable to fetch user list"))?;

        let mut work_units = identify_migration_work_units(&users, self.directory).await;
        collect_dependent_resources(self.api, &mut work_units.to_migrate).await?;

        let mut phase = MigrationPhase::Finished;
        if !work_units.missing.is_empty() {
            phase = MigrationPhase::FinishedWithMissing;
        }
        if !work_units.skipped.is_empty() {
            phase = MigrationPhase::FinishedWithSkipped;
        }

        for skipped in &work_units.skipped {
            let name = skipped.original_user.name();
            error!(user = %name, "unable to migrate user due to a connection failure; this user will be skipped");
            if !self.options.dry_run {
                record_user(status, UserList::Skipped, name).await;
            }
        }

        for missing in &work_units.missing {
            self.handle_missing_user(status, missing).await;
        }

        let total = work_units.to_migrate.len();
        for (index, unit) in work_units.to_migrate.iter_mut().enumerate() {
            self.migrate_user(unit).await;
            if !self.options.dry_run {
                if let Err(e) = status.set_progress(index, total).await {
                    error!(error = %e, "unable to update migration status");
                }
            }
        }

        migrate_allowed_principals(self.api, self.directory, &self.backoff, &work_units, self.options)
            .await
            .inspect_err(|e| error!(error = %e, "unable to migrate allowed principals"))?;

        Ok(phase)
    }

    async fn handle_missing_user(&self, status: &StatusTracker<'_, M>, missing: &MissingUserWorkUnit) {
        let name = missing.original_user.name();

        if !self.options.delete_missing_users {
            info!(user = %name, guid = %missing.guid, "user does not seem to exist in Active Directory. this user will be skipped");
            if !self.options.dry_run {
                record_user(status, UserList::Missing, name).await;
            }
            return;
        }

        info!(user = %name, guid = %missing.guid, "user does not seem to exist in Active Directory. deleteMissingUsers is true, proceeding to delete this user permanently");
        record_user(status, UserList::Missing, name).await;
        for user in std::iter::once(&missing.original_user).chain(&missing.duplicate_users) {
            if let Err(e) = delete_user(self.api, &self.backoff, user.name()).await {
                error!(user = %user.name(), error = %e, "failed to delete missing user");
            }
        }
    }

    /// Migrates the bindings and tokens of a work unit, then merges its users into the original user.
    #[instrument(skip_all, fields(user = %unit.original_user.name(), guid = %unit.guid))]
    async fn migrate_user(&self, unit: &mut MigrateUserWorkUnit) {
        let dry_run = self.options.dry_run;

        migrate_bindings(
            self.api,
            &self.backoff,
            unit,
            &unit.active_directory_crtbs,
            &unit.duplicate_local_crtbs,
            dry_run,
        )
        .await;
        migrate_bindings(
            self.api,
            &self.backoff,
            unit,
            &unit.active_directory_prtbs,
            &unit.duplicate_local_prtbs,
            dry_run,
        )
        .await;
        migrate_grbs(self.api, &self.backoff, unit, dry_run).await;
        migrate_tokens(self.api, &self.backoff, unit, dry_run).await;

        replace_guid_principal_with_dn(&mut unit.original_user, &unit.distinguished_name, &unit.guid, dry_run);

        if dry_run {
            describe_planned_changes(unit);
            return;
        }

        match delete_duplicate_users(self.api, &self.backoff, unit).await {
            Ok(()) => {
                if update_modified_user(self.api, &self.backoff, unit).await.is_ok() {
                    info!("user migrated to '{}'", unit.dn_principal());
                }
            }
            Err(_) => {
                error!("not all duplicate users could be deleted, the user will not be updated");
            }
        }
    }
}

async fn record_user<M: ManageResources>(status: &StatusTracker<'_, M>, list: UserList, name: &str) {
    if let Err(e) = status.append_user(list, name).await {
        error!(user = %name, error = %e, "unable to add user to {list} in migration status configmap");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use serde_json::json;

    use super::*;
    use crate::principal::active_directory_principal;
    use crate::resources::AuthConfig;
    use crate::resources::ClusterRoleTemplateBinding;
    use crate::resources::GlobalRoleBinding;
    use crate::resources::Principal;
    use crate::resources::ProjectRoleTemplateBinding;
    use crate::resources::Token;
    use crate::status::STATUS_CONFIG_MAP_NAME;
    use crate::status::STATUS_CONFIG_MAP_NAMESPACE;
    use crate::status::STATUS_MIGRATION_FIELD;
    use crate::testing::dn_user;
    use crate::testing::guid_user;
    use crate::testing::user;
    use crate::testing::FakeCluster;
    use crate::testing::FakeDirectory;
    use crate::testing::Verb;
    use crate::testing::DN;
    use crate::testing::GUID;

    const MISSING_GUID: &str = "0000aaaa";

    fn auth_config(enabled: bool) -> AuthConfig {
        serde_json::from_value(json!({
            "metadata": { "name": "activedirectory" },
            "enabled": enabled,
            "allowedPrincipalIds": [
                "local://u-admin",
                active_directory_principal(GUID)
            ]
        }))
        .unwrap()
    }

    fn crtb() -> ClusterRoleTemplateBinding {
        serde_json::from_value(json!({
            "metadata": { "name": "crtb-guid", "namespace": "c-m-abcde" },
            "clusterName": "c-m-abcde",
            "userName": "u-fydcaomakf",
            "userPrincipalName": active_directory_principal(GUID),
            "roleTemplateName": "cluster-member"
        }))
        .unwrap()
    }

    fn prtb() -> ProjectRoleTemplateBinding {
        serde_json::from_value(json!({
            "metadata": { "name": "prtb-guid", "namespace": "p-xyz" },
            "projectName": "c-m-abcde:p-xyz",
            "userName": "u-fydcaomakf",
            "userPrincipalName": active_directory_principal(GUID),
            "roleTemplateName": "project-member"
        }))
        .unwrap()
    }

    fn token() -> Token {
        serde_json::from_value(json!({
            "metadata": { "name": "token-guid" },
            "token": "s3cr3t",
            "userId": "u-fydcaomakf",
            "authProvider": "activedirectory",
            "userPrincipal": {
                "metadata": { "name": active_directory_principal(GUID) },
                "principalType": "user",
                "provider": "activedirectory"
            }
        }))
        .unwrap()
    }

    /// A cluster with the user `u-fydcaomakf`, known to the directory by its GUID, and its bindings.
    fn cluster() -> FakeCluster {
        FakeCluster::new()
            .with(auth_config(true))
            .with(guid_user("u-fydcaomakf", 0, GUID))
            .with(user("u-admin", 0, &["local://u-admin"]))
            .with(crtb())
            .with(prtb())
            .with(token())
    }

    fn directory() -> FakeDirectory {
        FakeDirectory::new().with_user(GUID, DN)
    }

    async fn run(cluster: &FakeCluster, directory: &FakeDirectory, options: MigrationOptions) -> Result<()> {
        Migration::new(cluster, directory, true, options)
            .with_backoff(Backoff::immediate(3))
            .run()
            .await
    }

    fn status(cluster: &FakeCluster) -> BTreeMap<String, String> {
        cluster
            .find::<ConfigMap>(Some(STATUS_CONFIG_MAP_NAMESPACE), STATUS_CONFIG_MAP_NAME)
            .and_then(|config_map| config_map.data)
            .unwrap_or_default()
    }

    fn phase(cluster: &FakeCluster) -> String {
        status(cluster).get(STATUS_MIGRATION_FIELD).cloned().unwrap_or_default()
    }

    fn dn_principal() -> String {
        active_directory_principal(DN)
    }

    #[tokio::test]
    async fn test_migrates_guid_user_and_its_resources() {
        // Given: A GUID-based user with a CRTB, a PRTB and a token
        let cluster = cluster();
        let directory = directory();

        // When: Running the migration
        run(&cluster, &directory, MigrationOptions::default()).await.unwrap();

        // Then: The user is known by its DN
        let user = cluster.find::<User>(None, "u-fydcaomakf").unwrap();
        assert_eq!(
            user.principal_ids,
            vec!["local://u-fydcaomakf".to_string(), dn_principal()]
        );
        assert_eq!(user.metadata.labels.unwrap()[MIGRATION_LABEL], MIGRATED_LABEL_VALUE);
        assert_eq!(user.metadata.annotations.unwrap()[MIGRATION_ANNOTATION], GUID);

        // And: Its bindings and token point at the DN principal
        let crtbs = cluster.objects::<ClusterRoleTemplateBinding>();
        assert_eq!(crtbs.len(), 1);
        assert_eq!(crtbs[0].user_principal_name, dn_principal());
        let prtbs = cluster.objects::<ProjectRoleTemplateBinding>();
        assert_eq!(prtbs.len(), 1);
        assert_eq!(prtbs[0].user_principal_name, dn_principal());
        let tokens = cluster.objects::<Token>();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].user_principal.id(), dn_principal());

        // And: The allowed principals and the status are updated
        let auth_config = cluster.find::<AuthConfig>(None, "activedirectory").unwrap();
        assert_eq!(
            auth_config.data["allowedPrincipalIds"],
            json!(["local://u-admin", dn_principal()])
        );
        assert_eq!(phase(&cluster), "Finished");
        assert_eq!(status(&cluster)["percentDone"], "100%");
        assert_eq!(
            auth_config.metadata.annotations.unwrap()["migration-ad-guid-migration-status"],
            "Finished"
        );
        assert!(directory.is_closed());
    }

    #[tokio::test]
    async fn test_merges_duplicate_users() {
        // Given: An older GUID-based user and a newer DN-based duplicate with its own bindings
        let cluster = FakeCluster::new()
            .with(auth_config(true))
            .with(guid_user("u-fydcaomakf", 0, GUID))
            .with(dn_user("u-duplicate", 5, DN))
            .with(
                serde_json::from_value::<ClusterRoleTemplateBinding>(json!({
                    "metadata": { "name": "crtb-dup", "namespace": "c-m-abcde" },
                    "clusterName": "c-m-abcde",
                    "userName": "u-duplicate",
                    "userPrincipalName": "local://u-duplicate",
                    "roleTemplateName": "cluster-member"
                }))
                .unwrap(),
            )
            .with(
                serde_json::from_value::<GlobalRoleBinding>(json!({
                    "metadata": { "name": "grb-dup" },
                    "globalRoleName": "user",
                    "userName": "u-duplicate"
                }))
                .unwrap(),
            );

        // When: Running the migration
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: Only the original user is left, owning the duplicate's bindings
        let users = cluster.objects::<User>();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name(), "u-fydcaomakf");
        assert_eq!(
            users[0].principal_ids,
            vec!["local://u-fydcaomakf".to_string(), dn_principal()]
        );
        let crtbs = cluster.objects::<ClusterRoleTemplateBinding>();
        assert_eq!(crtbs.len(), 1);
        assert_eq!(crtbs[0].user_name, "u-fydcaomakf");
        assert_eq!(crtbs[0].user_principal_name, "local://u-fydcaomakf");
        let grbs = cluster.objects::<GlobalRoleBinding>();
        assert_eq!(grbs.len(), 1);
        assert_eq!(grbs[0].user_name, "u-fydcaomakf");
    }

    #[tokio::test]
    async fn test_missing_user_is_flagged() {
        // Given: A GUID-based user the directory does not know
        let cluster = cluster().with(guid_user("u-missing", 3, MISSING_GUID));

        // When: Running without deleting missing users
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: The user is kept, unmigrated, and reported
        let missing = cluster.find::<User>(None, "u-missing").unwrap();
        assert_eq!(missing.principal_ids[1], active_directory_principal(MISSING_GUID));
        assert_eq!(phase(&cluster), "FinishedWithMissing");
        assert_eq!(status(&cluster)["missingUsers"], "u-missing");
        assert_eq!(status(&cluster)["missingUsersCount"], "1");
    }

    #[tokio::test]
    async fn test_missing_user_is_deleted() {
        // Given: A GUID-based user the directory does not know
        let cluster = cluster().with(guid_user("u-missing", 3, MISSING_GUID));
        let options = MigrationOptions {
            dry_run: false,
            delete_missing_users: true,
        };

        // When: Running while deleting missing users
        run(&cluster, &directory(), options).await.unwrap();

        // Then: The user is gone but still reported
        assert!(cluster.find::<User>(None, "u-missing").is_none());
        assert_eq!(phase(&cluster), "FinishedWithMissing");
        assert_eq!(status(&cluster)["missingUsers"], "u-missing");
    }

    #[tokio::test]
    async fn test_directory_failure_skips_remaining_users() {
        // Given: Two GUID-based users and a directory that breaks after the first lookup
        let other_guid = "aaaa2222";
        let cluster = cluster().with(guid_user("u-zzzzz", 1, other_guid));
        let directory = directory().with_user(other_guid, "CN=other").breaking_after(1);

        // When: Running the migration
        run(&cluster, &directory, MigrationOptions::default()).await.unwrap();

        // Then: The first user is migrated, the second one is skipped and reported
        let migrated = cluster.find::<User>(None, "u-fydcaomakf").unwrap();
        assert_eq!(migrated.principal_ids[1], dn_principal());
        let skipped = cluster.find::<User>(None, "u-zzzzz").unwrap();
        assert_eq!(skipped.principal_ids[1], active_directory_principal(other_guid));
        assert_eq!(phase(&cluster), "FinishedWithSkipped");
        assert_eq!(status(&cluster)["skippedUsers"], "u-zzzzz");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        // Given: A cluster with work to do
        let cluster = cluster();
        let options = MigrationOptions {
            dry_run: true,
            delete_missing_users: true,
        };

        // When: Running a dry run
        run(&cluster, &directory(), options).await.unwrap();

        // Then: Nothing was written, not even the status
        assert!(cluster.calls().is_empty());
        let user = cluster.find::<User>(None, "u-fydcaomakf").unwrap();
        assert_eq!(user.principal_ids[1], active_directory_principal(GUID));
    }

    #[tokio::test]
    async fn test_webhook_failures_are_retried() {
        // Given: A webhook failing twice on every kind of write
        let cluster = cluster();
        cluster.fail_internal::<ClusterRoleTemplateBinding>(Verb::Create, 2);
        cluster.fail_internal::<Token>(Verb::Delete, 2);
        cluster.fail_internal::<User>(Verb::Replace, 2);

        // When: Running with three attempts per write
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: Everything is migrated
        assert_eq!(cluster.objects::<ClusterRoleTemplateBinding>()[0].user_principal_name, dn_principal());
        assert_eq!(cluster.objects::<Token>().len(), 1);
        assert_eq!(cluster.find::<User>(None, "u-fydcaomakf").unwrap().principal_ids[1], dn_principal());
    }

    #[tokio::test]
    async fn test_failed_status_mirror_does_not_block_later_runs() {
        // Given: An auth config that rejects every annotation
        let cluster = cluster();
        cluster.fail_internal::<AuthConfig>(Verb::Annotate, 100);

        // When: Running the migration
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: The user is migrated and the run is recorded as finished
        assert_eq!(phase(&cluster), "Finished");
        assert_eq!(cluster.find::<User>(None, "u-fydcaomakf").unwrap().principal_ids[1], dn_principal());
        assert!(StatusTracker::new(&cluster).may_start().await);
    }

    #[tokio::test]
    async fn test_status_mirror_failure_is_retried() {
        // Given: The first status annotation of the auth config fails
        let cluster = cluster();
        cluster.fail_internal::<AuthConfig>(Verb::Annotate, 1);

        // When: Running the migration
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: The final phase reached both the config map and the auth config
        assert_eq!(phase(&cluster), "Finished");
        let auth_config = cluster.find::<AuthConfig>(None, "activedirectory").unwrap();
        assert_eq!(
            auth_config.metadata.annotations.unwrap()["migration-ad-guid-migration-status"],
            "Finished"
        );
    }

    #[tokio::test]
    async fn test_failed_binding_does_not_stop_the_user() {
        // Given: A webhook rejecting every CRTB create
        let cluster = cluster();
        cluster.fail_internal::<ClusterRoleTemplateBinding>(Verb::Create, 100);

        // When: Running the migration
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: The CRTB is untouched, everything else is migrated
        assert!(cluster.find::<ClusterRoleTemplateBinding>(Some("c-m-abcde"), "crtb-guid").is_some());
        assert_eq!(cluster.objects::<ProjectRoleTemplateBinding>()[0].user_principal_name, dn_principal());
        assert_eq!(cluster.find::<User>(None, "u-fydcaomakf").unwrap().principal_ids[1], dn_principal());
        assert_eq!(phase(&cluster), "Finished");
    }

    #[tokio::test]
    async fn test_failed_duplicate_deletion_keeps_user_unchanged() {
        // Given: A duplicate user that cannot be deleted
        let cluster = FakeCluster::new()
            .with(auth_config(true))
            .with(guid_user("u-fydcaomakf", 0, GUID))
            .with(guid_user("u-duplicate", 5, GUID));
        cluster.fail::<User>(Verb::Delete, 1, 403);

        // When: Running the migration
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: Both users are left as they were
        assert_eq!(cluster.objects::<User>().len(), 2);
        let original = cluster.find::<User>(None, "u-fydcaomakf").unwrap();
        assert_eq!(original.principal_ids[1], active_directory_principal(GUID));
    }

    #[tokio::test]
    async fn test_running_migration_blocks_another_run() {
        // Given: A run recorded as running
        let cluster = cluster();
        StatusTracker::new(&cluster).set_phase(MigrationPhase::Running).await.unwrap();
        let writes = cluster.calls().len();

        // When: Starting another run
        run(&cluster, &directory(), MigrationOptions::default()).await.unwrap();

        // Then: Nothing was touched
        assert_eq!(cluster.calls().len(), writes);
        assert_eq!(phase(&cluster), "Running");
    }

    #[tokio::test]
    async fn test_listing_failure_fails_the_run() {
        // Given: Tokens cannot be listed
        let cluster = cluster();
        cluster.fail::<Token>(Verb::List, 1, 403);

        // When: Running the migration
        let result = run(&cluster, &directory(), MigrationOptions::default()).await;

        // Then: The run fails without touching the user
        assert!(result.is_err());
        assert_eq!(phase(&cluster), "Failed");
        let user = cluster.find::<User>(None, "u-fydcaomakf").unwrap();
        assert_eq!(user.principal_ids[1], active_directory_principal(GUID));
    }

    #[tokio::test]
    async fn test_disabled_provider_finishes_immediately() {
        // Given: A disabled Active Directory provider
        let cluster = cluster();
        let directory = directory();

        // When: Running the migration
        Migration::new(&cluster, &directory, false, MigrationOptions::default())
            .with_backoff(Backoff::immediate(3))
            .run()
            .await
            .unwrap();

        // Then: The run finished without looking at users
        assert_eq!(phase(&cluster), "Finished");
        assert!(directory.lookups().is_empty());
        assert_eq!(cluster.objects::<ClusterRoleTemplateBinding>()[0].metadata.name.as_deref(), Some("crtb-guid"));
    }

    struct PanickingDirectory;

    #[async_trait]
    impl LookupUser for PanickingDirectory {
        async fn find_user_with_retries(&self, _guid: &str) -> Result<(String, Principal)> {
            panic!("directory exploded");
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_panic_records_failed_phase() {
        // Given: A directory that panics on lookup
        let cluster = cluster();

        // When: Running the migration
        let outcome = AssertUnwindSafe(
            Migration::new(&cluster, &PanickingDirectory, true, MigrationOptions::default())
                .with_backoff(Backoff::immediate(3))
                .run(),
        )
        .catch_unwind()
        .await;

        // Then: The panic is passed on, but the run is not left as running
        assert!(outcome.is_err());
        assert_eq!(phase(&cluster), "Failed");
    }
}
