//! Run options and the Active Directory configuration stored by Rancher.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use crate::error::Error;
use crate::error::Result;
use crate::k8s::ManageResources;
use crate::principal::ACTIVE_DIRECTORY_PROVIDER;
use crate::resources::AuthConfig;

/// Key of the service account password inside the secret referenced by the auth config.
const SERVICE_ACCOUNT_PASSWORD_FIELD: &str = "serviceaccountpassword";

const DEFAULT_PORT: u16 = 389;
const DEFAULT_TLS_PORT: u16 = 636;

/// Options of a single migration run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Only log what would be changed.
    pub dry_run: bool,
    /// Delete users that no longer exist in Active Directory instead of only reporting them.
    pub delete_missing_users: bool,
}

impl MigrationOptions {
    /// A dry run never deletes anything, so `delete_missing_users` is dropped when `dry_run` is set.
    pub fn normalized(self) -> Self {
        if self.dry_run {
            MigrationOptions {
                dry_run: true,
                delete_missing_users: false,
            }
        } else {
            self
        }
    }
}

/// The `activedirectory` auth config. Attributes missing from the stored object fall back to the values
/// Rancher uses.
#[derive(Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDirectoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, rename = "startTLS")]
    pub start_tls: bool,
    /// PEM encoded CA certificates trusted on top of the system roots.
    #[serde(default)]
    pub certificate: String,
    /// In milliseconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default)]
    pub service_account_username: String,
    /// Either the password itself or, as stored by Rancher, a `namespace:name` reference to a secret.
    #[serde(default)]
    pub service_account_password: String,
    #[serde(default)]
    pub default_login_domain: String,
    #[serde(default)]
    pub user_search_base: String,
    #[serde(default = "default_user_object_class")]
    pub user_object_class: String,
    #[serde(default = "default_name_attribute")]
    pub user_name_attribute: String,
    #[serde(default = "default_user_login_attribute")]
    pub user_login_attribute: String,
    #[serde(default = "default_user_enabled_attribute")]
    pub user_enabled_attribute: String,
    #[serde(default = "default_group_object_class")]
    pub group_object_class: String,
    #[serde(default = "default_name_attribute")]
    pub group_name_attribute: String,
}

fn default_connection_timeout() -> u64 {
    5000
}

fn default_user_object_class() -> String {
    "person".to_owned()
}

fn default_name_attribute() -> String {
    "name".to_owned()
}

fn default_user_login_attribute() -> String {
    "sAMAccountName".to_owned()
}

fn default_user_enabled_attribute() -> String {
    "userAccountControl".to_owned()
}

fn default_group_object_class() -> String {
    "group".to_owned()
}

impl Default for ActiveDirectoryConfig {
    fn default() -> Self {
        ActiveDirectoryConfig {
            enabled: false,
            servers: Vec::new(),
            port: 0,
            tls: false,
            start_tls: false,
            certificate: String::new(),
            connection_timeout: default_connection_timeout(),
            service_account_username: String::new(),
            service_account_password: String::new(),
            default_login_domain: String::new(),
            user_search_base: String::new(),
            user_object_class: default_user_object_class(),
            user_name_attribute: default_name_attribute(),
            user_login_attribute: default_user_login_attribute(),
            user_enabled_attribute: default_user_enabled_attribute(),
            group_object_class: default_group_object_class(),
            group_name_attribute: default_name_attribute(),
        }
    }
}

impl fmt::Debug for ActiveDirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveDirectoryConfig")
            .field("enabled", &self.enabled)
            .field("servers", &self.servers)
            .field("port", &self.port())
            .field("tls", &self.tls)
            .field("start_tls", &self.start_tls)
            .field("connection_timeout", &self.connection_timeout)
            .field("service_account_username", &self.service_account_username)
            .field("service_account_password", &"<redacted>")
            .field("user_search_base", &self.user_search_base)
            .field("user_object_class", &self.user_object_class)
            .finish_non_exhaustive()
    }
}

impl ActiveDirectoryConfig {
    /// The configured port, or the LDAP default for the configured transport.
    pub fn port(&self) -> u16 {
        match (self.port, self.tls) {
            (0, true) => DEFAULT_TLS_PORT,
            (0, false) => DEFAULT_PORT,
            (port, _) => port,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    /// The user to bind as, qualified with the default login domain.
    pub fn bind_user(&self) -> String {
        user_external_id(&self.service_account_username, &self.default_login_domain)
    }

    /// Attributes to request when searching for users, followed by `extra`.
    pub fn user_search_attributes(&self, extra: &[&str]) -> Vec<String> {
        extra
            .iter()
            .map(|attribute| (*attribute).to_owned())
            .chain([
                self.user_object_class.clone(),
                self.user_login_attribute.clone(),
                self.user_name_attribute.clone(),
                self.user_enabled_attribute.clone(),
            ])
            .collect()
    }
}

/// Qualifies `username` as `DOMAIN\username`, unless it already names a domain or no domain is set.
pub fn user_external_id(username: &str, login_domain: &str) -> String {
    if username.contains('\\') || login_domain.is_empty() {
        username.to_owned()
    } else {
        format!("{login_domain}\\{username}")
    }
}

/// Reads the `activedirectory` auth config and resolves the service account password.
pub async fn load_active_directory_config(api: &impl ManageResources) -> Result<ActiveDirectoryConfig> {
    let auth_config: AuthConfig = api
        .get(None, ACTIVE_DIRECTORY_PROVIDER)
        .await
        .inspect_err(|e| error!(error = %e, "failed to obtain activedirectory auth config"))?;

    let mut config = decode_active_directory_config(&auth_config)?;
    if !config.service_account_password.is_empty() {
        config.service_account_password = read_from_secret(api, &config.service_account_password).await?;
    }

    Ok(config)
}

pub fn decode_active_directory_config(auth_config: &AuthConfig) -> Result<ActiveDirectoryConfig> {
    serde_json::from_value(Value::Object(auth_config.data.clone()))
        .map_err(|e| Error::InvalidConfig(format!("errors while decoding stored AD config: {e}")))
}

/// Resolves a `namespace:name` secret reference. Anything else is returned as it is.
async fn read_from_secret(api: &impl ManageResources, reference: &str) -> Result<String> {
    let Some((namespace, name)) = reference.split_once(':') else {
        return Ok(reference.to_owned());
    };

    let secret: Secret = api.get(Some(namespace), name).await?;
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SERVICE_ACCOUNT_PASSWORD_FIELD))
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "secret '{reference}' has no field '{SERVICE_ACCOUNT_PASSWORD_FIELD}'"
            ))
        })?;

    String::from_utf8(value.0.clone())
        .map_err(|_| Error::InvalidConfig(format!("secret '{reference}' does not hold a valid password")))
}
