//! `ad-unmigration` moves Rancher users that logged in through Active Directory from GUID-based
//! principal IDs (`activedirectory_user://953d82a0...`) back to Distinguished Name based ones
//! (`activedirectory_user://CN=testuser1,CN=Users,DC=qa,DC=rancher,DC=space`).
//!
//! ## Pipeline
//!
//! A run goes through these steps, one object at a time:
//!
//! 1. The [status] tracker refuses to start while another run is marked as running, then marks this one.
//! 2. The [identify] step sorts all users into work units: users to migrate, users missing from the
//!    directory and users skipped because the directory could not be reached. Users sharing the same
//!    directory identity are merged into one work unit, keeping the oldest user.
//! 3. The [collect] step attributes role bindings and tokens to the work units.
//! 4. The [migrate] step recreates every attributed binding and token with the new principal, deletes the
//!    duplicate users, saves the kept user and finally rewrites the allowed principal list of the
//!    Active Directory auth config.
//!
//! ## Usage
//!
//! ```no_run
//! use ad_unmigration::unmigrate_ad_guid_users;
//! use ad_unmigration::MigrationOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = kube::Config::infer().await?;
//!     let options = MigrationOptions {
//!         dry_run: true,
//!         delete_missing_users: false,
//!     };
//!
//!     unmigrate_ad_guid_users(config, options).await?;
//!     Ok(())
//! }
//! ```
//!
//! With `dry_run` nothing is written. Every planned change is logged instead.
//!
//! ## Error Handling
//!
//! All fallible functions return [`error::Result`]. Failures of a single binding or token are logged and
//! do not stop the run; failing to list users or bindings aborts it and records the `Failed` phase.

pub mod backoff;
pub mod collect;
pub mod config;
pub mod directory;
pub mod error;
pub mod identify;
pub mod k8s;
pub mod migrate;
pub mod principal;
pub mod resources;
pub mod status;

#[cfg(test)]
mod testing;

use kube::Resource;

pub use crate::config::MigrationOptions;
use crate::error::Error;
use crate::error::Result;
pub use crate::migrate::unmigrate_ad_guid_users;
pub use crate::migrate::unmigrate_ad_guid_users_once;

/// The TryResource trait is used to try to extract the name and the namespace of a resources
/// metadata and encapsulates the error handling.
pub trait TryResource {
    fn try_name(&self) -> Result<&str>;
    fn try_namespace(&self) -> Result<String>;
}

impl<R> TryResource for R
where
    R: Resource,
{
    fn try_name(&self) -> Result<&str> {
        self.meta().name.as_deref().ok_or(Error::UnnamedObject)
    }

    fn try_namespace(&self) -> Result<String> {
        self.meta().namespace.clone().ok_or(Error::UserInput(
            "Expected resource to be namespaced, but it has no namespace".to_owned(),
        ))
    }
}
