//! Migration Status Tracker.
//!
//! The state of the migration is kept in the `cattle-system/ad-guid-migration` config map so that it
//! survives restarts, and mirrored to annotations of the Active Directory auth config. A run refuses to
//! start while the recorded phase is [`MigrationPhase::Running`].

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::SecondsFormat;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use strum::AsRefStr;
use strum::Display;
use strum::EnumString;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backoff::retry_with_backoff;
use crate::backoff::Backoff;
use crate::error::Error;
use crate::error::Result;
use crate::k8s::ManageResources;
use crate::migrate::MIGRATE_AD_USER_OPERATION;
use crate::principal::ACTIVE_DIRECTORY_PROVIDER;
use crate::resources::AuthConfig;

pub const STATUS_CONFIG_MAP_NAMESPACE: &str = "cattle-system";
pub const STATUS_CONFIG_MAP_NAME: &str = "ad-guid-migration";
pub const STATUS_MIGRATION_FIELD: &str = "ad-guid-migration-status";
pub const STATUS_PERCENTAGE_FIELD: &str = "percentDone";
pub const STATUS_LAST_UPDATE_FIELD: &str = "statusLastUpdated";
pub const STATUS_ANNOTATION_PREFIX: &str = "migration-";

const COUNT_SUFFIX: &str = "Count";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr)]
pub enum MigrationPhase {
    Running,
    Finished,
    FinishedWithMissing,
    FinishedWithSkipped,
    Failed,
}

/// The user name lists kept in the config map. They are not mirrored to the auth config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
pub enum UserList {
    #[strum(serialize = "skippedUsers")]
    Skipped,
    #[strum(serialize = "missingUsers")]
    Missing,
}

impl UserList {
    fn count_key(self) -> String {
        format!("{}{COUNT_SUFFIX}", self.as_ref())
    }

    fn is_list_key(key: &str) -> bool {
        key == UserList::Skipped.as_ref() || key == UserList::Missing.as_ref()
    }
}

/// Reads and writes the persisted migration status.
pub struct StatusTracker<'a, M> {
    api: &'a M,
    backoff: Backoff,
}

impl<'a, M: ManageResources> StatusTracker<'a, M> {
    pub fn new(api: &'a M) -> Self {
        StatusTracker {
            api,
            backoff: Backoff::api(),
        }
    }

    /// Overrides the backoff used for status writes.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn config_map(&self) -> Result<Option<ConfigMap>> {
        self.api
            .get_opt(Some(STATUS_CONFIG_MAP_NAMESPACE), STATUS_CONFIG_MAP_NAME)
            .await
    }

    /// The recorded phase. `None` if there is no status yet or it holds an unknown phase.
    pub async fn phase(&self) -> Result<Option<MigrationPhase>> {
        let config_map = self.config_map().await?;
        let phase = config_map
            .as_ref()
            .and_then(|config_map| config_map.data.as_ref())
            .and_then(|data| data.get(STATUS_MIGRATION_FIELD));

        Ok(phase.and_then(|phase| {
            MigrationPhase::from_str(phase)
                .inspect_err(|_| warn!(phase = %phase, "unknown migration phase recorded"))
                .ok()
        }))
    }

    /// Whether a run may start now. Refuses while another run is recorded as running, or when that
    /// cannot be told.
    pub async fn may_start(&self) -> bool {
        match self.phase().await {
            Err(e) => {
                error!(operation = MIGRATE_AD_USER_OPERATION, error = %e, "unable to check unmigration configmap");
                error!(operation = MIGRATE_AD_USER_OPERATION, "cannot determine if it is safe to proceed. refusing to run");
                false
            }
            Ok(Some(MigrationPhase::Running)) => {
                info!(operation = MIGRATE_AD_USER_OPERATION, "ad-guid migration is currently running, refusing to run again concurrently");
                false
            }
            Ok(_) => true,
        }
    }

    /// Like [`StatusTracker::may_start`], but also refuses once a run has finished.
    pub async fn may_start_once(&self) -> bool {
        match self.phase().await {
            Err(e) => {
                error!(operation = MIGRATE_AD_USER_OPERATION, error = %e, "unable to check unmigration configmap");
                error!(operation = MIGRATE_AD_USER_OPERATION, "cannot determine if it is safe to proceed. refusing to run");
                false
            }
            Ok(Some(MigrationPhase::Finished)) => {
                debug!(operation = MIGRATE_AD_USER_OPERATION, "ad-guid migration has already been completed, refusing to run again at startup");
                false
            }
            Ok(Some(MigrationPhase::FinishedWithMissing)) => {
                info!(operation = MIGRATE_AD_USER_OPERATION, "ad-guid migration has already been completed. To clean-up missing users, you can run the utility manually");
                false
            }
            Ok(Some(MigrationPhase::FinishedWithSkipped)) => {
                info!(operation = MIGRATE_AD_USER_OPERATION, "ad-guid migration has already been completed. To try and resolve skipped users, you can run the utility manually");
                false
            }
            Ok(_) => true,
        }
    }

    /// Applies `change` to the status data, stamps it and saves it, creating the config map if needed.
    ///
    /// Only the config map write can fail the update. A failed mirror to the auth config is logged.
    async fn update(&self, change: impl FnOnce(&mut BTreeMap<String, String>) + Send) -> Result<()> {
        let existing = self.config_map().await?;
        let exists = existing.is_some();
        let mut config_map = existing.unwrap_or_else(|| ConfigMap {
            metadata: ObjectMeta {
                name: Some(STATUS_CONFIG_MAP_NAME.to_owned()),
                namespace: Some(STATUS_CONFIG_MAP_NAMESPACE.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        });

        let data = config_map.data.get_or_insert_with(BTreeMap::new);
        change(data);
        data.insert(
            STATUS_LAST_UPDATE_FIELD.to_owned(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let data = data.clone();

        let config_map = &config_map;
        retry_with_backoff(&self.backoff, "update migration status", Error::is_internal, || async move {
            if !exists {
                return self.api.create(config_map).await;
            }
            match self.api.replace(config_map).await {
                Err(e) if e.is_not_found() => self.api.create(config_map).await,
                other => other,
            }
        })
        .await?;

        if let Err(e) = self.mirror_to_auth_config(&data).await {
            warn!(operation = MIGRATE_AD_USER_OPERATION, error = %e, "unable to mirror migration status to auth config");
        }
        Ok(())
    }

    /// Copies the status, without the user name lists, to annotations of the auth config.
    async fn mirror_to_auth_config(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let annotations: BTreeMap<String, String> = data
            .iter()
            .filter(|(key, _)| !UserList::is_list_key(key))
            .map(|(key, value)| (format!("{STATUS_ANNOTATION_PREFIX}{key}"), value.clone()))
            .collect();
        let annotations = &annotations;

        retry_with_backoff(&self.backoff, "mirror migration status", Error::is_internal, || async move {
            self.api
                .annotate::<AuthConfig>(None, ACTIVE_DIRECTORY_PROVIDER, annotations)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn set(&self, field: &str, value: &str) -> Result<()> {
        self.update(|data| {
            data.insert(field.to_owned(), value.to_owned());
        })
        .await
    }

    pub async fn set_phase(&self, phase: MigrationPhase) -> Result<()> {
        self.set(STATUS_MIGRATION_FIELD, phase.as_ref()).await
    }

    /// Records that `index + 1` of `total` users are done.
    pub async fn set_progress(&self, index: usize, total: usize) -> Result<()> {
        self.set(STATUS_PERCENTAGE_FIELD, &progress(index, total)).await
    }

    pub async fn reset_user_list(&self, list: UserList) -> Result<()> {
        self.update(|data| {
            data.remove(list.as_ref());
            data.remove(&list.count_key());
        })
        .await
    }

    pub async fn append_user(&self, list: UserList, user_name: &str) -> Result<()> {
        self.update(|data| {
            let names = match data.get(list.as_ref()).filter(|names| !names.is_empty()) {
                Some(names) => format!("{names},{user_name}"),
                None => user_name.to_owned(),
            };
            data.insert(list.count_key(), names.split(',').count().to_string());
            data.insert(list.as_ref().to_owned(), names);
        })
        .await
    }
}

pub fn progress(index: usize, total: usize) -> String {
    let percent = (index + 1) as f64 / total.max(1) as f64 * 100.0;
    format!("{percent:.0}%")
}
