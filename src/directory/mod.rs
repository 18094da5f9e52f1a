//! Directory Client: resolves legacy GUIDs to distinguished names through Active Directory.
//!
//! The session is opened lazily by [`SharedConnection`] on the first lookup and reused for all following
//! lookups. A failed search tears the session down, and the next attempt opens a fresh one.

mod ldap;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

pub use self::ldap::LdapConnection;
pub use self::ldap::LdapConnector;
use crate::backoff::retry_with_backoff;
use crate::backoff::Backoff;
use crate::config::ActiveDirectoryConfig;
use crate::error::Error;
use crate::error::Result;
use crate::principal::escape_uuid;
use crate::principal::ACTIVE_DIRECTORY_PROVIDER;
use crate::principal::ACTIVE_DIRECTORY_SCOPE;
use crate::resources::Principal;

pub const ATTRIBUTE_OBJECT_CLASS: &str = "objectClass";
pub const ATTRIBUTE_OBJECT_GUID: &str = "objectGUID";
pub const ATTRIBUTE_MEMBER_OF: &str = "memberOf";

const USER_PRINCIPAL_TYPE: &str = "user";
const GROUP_PRINCIPAL_TYPE: &str = "group";

/// A single search result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Values of an attribute, matching its name case-insensitively.
    fn values(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(attribute, _)| attribute.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    fn is_type(&self, object_class: &str) -> bool {
        self.values(ATTRIBUTE_OBJECT_CLASS)
            .is_some_and(|classes| classes.iter().any(|class| class.eq_ignore_ascii_case(object_class)))
    }
}

/// Opens authenticated directory sessions.
#[async_trait]
pub trait Connect: Send + Sync {
    type Connection: Search;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// An open, bound directory session.
#[async_trait]
pub trait Search: Send {
    /// Searches the whole subtree below `base`.
    async fn search(&mut self, base: &str, filter: &str, attributes: &[String]) -> Result<Vec<DirectoryEntry>>;

    async fn close(&mut self);
}

/// Resolves a GUID to the distinguished name and principal of its user.
#[async_trait]
pub trait LookupUser: Send + Sync {
    /// Returns [`Error::LdapNotFound`] or [`Error::LdapDuplicateGuid`] when the directory answered, and
    /// [`Error::LdapConnectionPermanentlyFailed`] when it could not be reached within the retry budget.
    async fn find_user_with_retries(&self, guid: &str) -> Result<(String, Principal)>;

    /// Closes the session, if one is open.
    async fn close(&self);
}

/// Errors that indicate a broken session rather than an answer of the directory.
pub fn is_connection_failure(error: &Error) -> bool {
    !error.is_definitive_ldap_answer() && !matches!(error, Error::PrincipalAttributes(_))
}

pub fn user_filter(guid: &str, config: &ActiveDirectoryConfig) -> String {
    format!(
        "(&({ATTRIBUTE_OBJECT_CLASS}={})({ATTRIBUTE_OBJECT_GUID}={}))",
        config.user_object_class,
        escape_uuid(guid)
    )
}

/// Runs exactly one search for the user with the given GUID.
pub async fn find_user<S>(connection: &mut S, guid: &str, config: &ActiveDirectoryConfig) -> Result<(String, Principal)>
where
    S: Search + ?Sized,
{
    let filter = user_filter(guid, config);
    let attributes = config.user_search_attributes(&[ATTRIBUTE_MEMBER_OF, ATTRIBUTE_OBJECT_CLASS]);

    let mut entries = connection.search(&config.user_search_base, &filter, &attributes).await?;
    let entry = match entries.len() {
        0 => return Err(Error::LdapNotFound),
        1 => entries.remove(0),
        _ => return Err(Error::LdapDuplicateGuid),
    };

    let principal = attributes_to_principal(&entry, config)?;
    Ok((entry.dn, principal))
}

/// Builds the principal of a user or group entry. Entries of any other class are rejected.
pub fn attributes_to_principal(entry: &DirectoryEntry, config: &ActiveDirectoryConfig) -> Result<Principal> {
    let (principal_type, name_attribute) = if entry.is_type(&config.user_object_class) {
        (USER_PRINCIPAL_TYPE, &config.user_name_attribute)
    } else if entry.is_type(&config.group_object_class) {
        (GROUP_PRINCIPAL_TYPE, &config.group_name_attribute)
    } else {
        return Err(Error::PrincipalAttributes(entry.dn.clone()));
    };

    let first_value = |attribute: &str| {
        entry
            .values(attribute)
            .and_then(|values| values.first())
            .filter(|value| !value.is_empty())
            .cloned()
    };

    let display_name = first_value(name_attribute).unwrap_or_else(|| entry.dn.clone());
    let login_name = first_value(&config.user_login_attribute).unwrap_or_else(|| display_name.clone());

    let mut principal = Principal {
        display_name,
        login_name,
        principal_type: principal_type.to_owned(),
        me: true,
        provider: ACTIVE_DIRECTORY_PROVIDER.to_owned(),
        ..Default::default()
    };
    principal.metadata.name = Some(format!("{ACTIVE_DIRECTORY_SCOPE}://{}", entry.dn));

    Ok(principal)
}

/// One directory session shared by all lookups of a run.
pub struct SharedConnection<C: Connect> {
    connector: C,
    config: ActiveDirectoryConfig,
    connection: Mutex<Option<C::Connection>>,
    backoff: Backoff,
}

impl SharedConnection<LdapConnector> {
    pub fn ldap(config: ActiveDirectoryConfig) -> Self {
        SharedConnection::new(LdapConnector::new(config.clone()), config)
    }
}

impl<C: Connect> SharedConnection<C> {
    pub fn new(connector: C, config: ActiveDirectoryConfig) -> Self {
        SharedConnection {
            connector,
            config,
            connection: Mutex::new(None),
            backoff: Backoff::directory(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn is_open(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn find_user_once(&self, guid: &str) -> Result<(String, Principal)> {
        let mut guard = self.connection.lock().await;
        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => self
                .connector
                .connect()
                .await
                .inspect_err(|e| warn!(error = %e, "LDAP connection failed, retrying"))?,
        };

        let result = find_user(&mut connection, guid, &self.config).await;
        match &result {
            Err(e) if is_connection_failure(e) => {
                warn!(guid = %guid, error = %e, "LDAP search failed, reconnecting");
                connection.close().await;
            }
            _ => *guard = Some(connection),
        }

        result
    }
}

#[async_trait]
impl<C: Connect> LookupUser for SharedConnection<C> {
    async fn find_user_with_retries(&self, guid: &str) -> Result<(String, Principal)> {
        let result = retry_with_backoff(&self.backoff, "ldap user search", is_connection_failure, || {
            self.find_user_once(guid)
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { source, attempts, .. }) => {
                warn!(guid = %guid, attempts = attempts, error = %source, "giving up on LDAP search");
                Err(Error::LdapConnectionPermanentlyFailed)
            }
            other => other,
        }
    }

    async fn close(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            debug!("closing LDAP connection");
            connection.close().await;
        }
    }
}
