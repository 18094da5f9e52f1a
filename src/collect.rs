//! Dependent-Resource Collector: attributes bindings and tokens to the work units they belong to.

use std::collections::HashMap;

use tracing::error;
use tracing::warn;

use crate::error::Result;
use crate::identify::MigrateUserWorkUnit;
use crate::k8s::ManageResources;
use crate::principal::local_principal;
use crate::principal::IDENTIFY_AD_USER_OPERATION;
use crate::resources::ClusterRoleTemplateBinding;
use crate::resources::GlobalRoleBinding;
use crate::resources::KubeObject;
use crate::resources::ProjectRoleTemplateBinding;
use crate::resources::Token;

/// Which list of a work unit an object belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    /// References the GUID-based principal and needs the DN-based principal instead.
    ActiveDirectory,
    /// References a duplicate user and needs to point at the original user instead.
    DuplicateLocal,
}

/// An object granted to, or issued for, a single user.
pub trait BoundToUser: KubeObject {
    fn user_name(&self) -> &str;

    fn user_principal_name(&self) -> &str;

    /// The list of `unit` holding objects of this kind for `bucket`.
    fn bucket(unit: &mut MigrateUserWorkUnit, bucket: Bucket) -> &mut Vec<Self>;
}

impl BoundToUser for ClusterRoleTemplateBinding {
    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn user_principal_name(&self) -> &str {
        &self.user_principal_name
    }

    fn bucket(unit: &mut MigrateUserWorkUnit, bucket: Bucket) -> &mut Vec<Self> {
        match bucket {
            Bucket::ActiveDirectory => &mut unit.active_directory_crtbs,
            Bucket::DuplicateLocal => &mut unit.duplicate_local_crtbs,
        }
    }
}

impl BoundToUser for ProjectRoleTemplateBinding {
    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn user_principal_name(&self) -> &str {
        &self.user_principal_name
    }

    fn bucket(unit: &mut MigrateUserWorkUnit, bucket: Bucket) -> &mut Vec<Self> {
        match bucket {
            Bucket::ActiveDirectory => &mut unit.active_directory_prtbs,
            Bucket::DuplicateLocal => &mut unit.duplicate_local_prtbs,
        }
    }
}

impl BoundToUser for Token {
    fn user_name(&self) -> &str {
        &self.user_id
    }

    fn user_principal_name(&self) -> &str {
        self.user_principal.id()
    }

    fn bucket(unit: &mut MigrateUserWorkUnit, bucket: Bucket) -> &mut Vec<Self> {
        match bucket {
            Bucket::ActiveDirectory => &mut unit.active_directory_tokens,
            Bucket::DuplicateLocal => &mut unit.duplicate_local_tokens,
        }
    }
}

/// Work unit indices keyed by the principal IDs that need to be migrated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrincipalIndex {
    /// The GUID-based principal of every work unit.
    pub active_directory: HashMap<String, usize>,
    /// For work units with duplicates: the GUID-based principal, the DN-based principal and the local
    /// principal of every duplicate.
    pub duplicate_local: HashMap<String, usize>,
}

impl PrincipalIndex {
    pub fn new(units: &[MigrateUserWorkUnit]) -> Self {
        let mut index = PrincipalIndex::default();
        for (i, unit) in units.iter().enumerate() {
            index.active_directory.insert(unit.guid_principal(), i);
            if unit.duplicate_users.is_empty() {
                continue;
            }
            index.duplicate_local.insert(unit.guid_principal(), i);
            index.duplicate_local.insert(unit.dn_principal(), i);
            for duplicate in &unit.duplicate_users {
                index.duplicate_local.insert(local_principal(duplicate.name()), i);
            }
        }
        index
    }

    /// Finds the work unit and list `object` belongs to.
    ///
    /// Objects whose user is not part of the work unit their principal points at are rejected.
    pub fn attribute<B: BoundToUser>(&self, object: &B, units: &[MigrateUserWorkUnit]) -> Option<(usize, Bucket)> {
        let principal = object.user_principal_name();
        let (index, bucket) = if let Some(&index) = self.active_directory.get(principal) {
            (index, Bucket::ActiveDirectory)
        } else if let Some(&index) = self.duplicate_local.get(principal) {
            (index, Bucket::DuplicateLocal)
        } else {
            return None;
        };

        if !units[index].contains_name(object.user_name()) {
            warn!(
                operation = IDENTIFY_AD_USER_OPERATION,
                kind = B::KIND,
                name = %object.metadata().name.as_deref().unwrap_or_default(),
                principal = %principal,
                user = %object.user_name(),
                "found object for a migrated principal, but no user with that name belongs to it. refusing to process"
            );
            return None;
        }

        Some((index, bucket))
    }
}

/// Adds every object that belongs to one of `units` to its list.
pub fn attribute_all<B: BoundToUser>(objects: Vec<B>, units: &mut [MigrateUserWorkUnit]) {
    let index = PrincipalIndex::new(units);
    for object in objects {
        if let Some((i, bucket)) = index.attribute(&object, units) {
            B::bucket(&mut units[i], bucket).push(object);
        }
    }
}

async fn collect<B, M>(api: &M, units: &mut [MigrateUserWorkUnit]) -> Result<()>
where
    B: BoundToUser,
    M: ManageResources,
{
    let objects: Vec<B> = api
        .list()
        .await
        .inspect_err(|e| error!(kind = B::KIND, error = %e, "unable to fetch objects"))?;
    attribute_all(objects, units);
    Ok(())
}

pub async fn collect_tokens(api: &impl ManageResources, units: &mut [MigrateUserWorkUnit]) -> Result<()> {
    collect::<Token, _>(api, units).await
}

pub async fn collect_crtbs(api: &impl ManageResources, units: &mut [MigrateUserWorkUnit]) -> Result<()> {
    collect::<ClusterRoleTemplateBinding, _>(api, units).await
}

pub async fn collect_prtbs(api: &impl ManageResources, units: &mut [MigrateUserWorkUnit]) -> Result<()> {
    collect::<ProjectRoleTemplateBinding, _>(api, units).await
}

/// Global role bindings carry no principal. They are attributed by the name of a duplicate user.
pub async fn collect_grbs(api: &impl ManageResources, units: &mut [MigrateUserWorkUnit]) -> Result<()> {
    let grbs: Vec<GlobalRoleBinding> = api
        .list()
        .await
        .inspect_err(|e| error!(kind = "GlobalRoleBinding", error = %e, "unable to fetch objects"))?;

    let units_by_duplicate_name: HashMap<String, usize> = units
        .iter()
        .enumerate()
        .flat_map(|(i, unit)| unit.duplicate_users.iter().map(move |user| (user.name().to_owned(), i)))
        .collect();

    for grb in grbs {
        if let Some(&i) = units_by_duplicate_name.get(&grb.user_name) {
            units[i].duplicate_local_grbs.push(grb);
        }
    }

    Ok(())
}

/// Collects tokens, cluster and project role template bindings and global role bindings.
///
/// Fails if any of them cannot be listed.
pub async fn collect_dependent_resources(api: &impl ManageResources, units: &mut [MigrateUserWorkUnit]) -> Result<()> {
    collect_tokens(api, units).await?;
    collect_crtbs(api, units).await?;
    collect_prtbs(api, units).await?;
    collect_grbs(api, units).await
}
