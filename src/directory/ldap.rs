use async_trait::async_trait;
use ldap3::Ldap;
use ldap3::LdapConnAsync;
use ldap3::LdapConnSettings;
use ldap3::Scope;
use ldap3::SearchEntry;
use native_tls::Certificate;
use native_tls::TlsConnector;
use tracing::debug;
use tracing::warn;

use super::Connect;
use super::DirectoryEntry;
use super::Search;
use crate::config::ActiveDirectoryConfig;
use crate::error::Error;
use crate::error::Result;

const PEM_END: &str = "-----END CERTIFICATE-----";

/// Connects to the configured Active Directory servers and binds with the service account.
#[derive(Clone, Debug)]
pub struct LdapConnector {
    config: ActiveDirectoryConfig,
}

impl LdapConnector {
    pub fn new(config: ActiveDirectoryConfig) -> Self {
        LdapConnector { config }
    }

    fn url(&self, server: &str) -> String {
        let scheme = if self.config.tls { "ldaps" } else { "ldap" };
        format!("{scheme}://{server}:{}", self.config.port())
    }

    fn settings(&self) -> Result<LdapConnSettings> {
        Ok(LdapConnSettings::new()
            .set_conn_timeout(self.config.connection_timeout())
            .set_starttls(self.config.start_tls && !self.config.tls)
            .set_connector(tls_connector(&self.config.certificate)?))
    }

    async fn connect_to(&self, server: &str) -> Result<LdapConnection> {
        let url = self.url(server);
        debug!(url = %url, "connecting to LDAP server");

        let (connection, mut ldap) = LdapConnAsync::with_settings(self.settings()?, &url).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.drive().await {
                warn!(error = %e, "LDAP connection closed with error");
            }
        });

        ldap.with_timeout(self.config.connection_timeout())
            .simple_bind(&self.config.bind_user(), &self.config.service_account_password)
            .await?
            .success()?;

        Ok(LdapConnection {
            ldap,
            config: self.config.clone(),
        })
    }
}

#[async_trait]
impl Connect for LdapConnector {
    type Connection = LdapConnection;

    /// Tries the servers in their configured order and returns the first session that binds.
    async fn connect(&self) -> Result<LdapConnection> {
        let mut last_error = None;
        for server in &self.config.servers {
            match self.connect_to(server).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(server = %server, error = %e, "failed to connect to LDAP server");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::InvalidConfig("no Active Directory servers configured".to_owned())))
    }
}

/// A bound session on one Active Directory server.
pub struct LdapConnection {
    ldap: Ldap,
    config: ActiveDirectoryConfig,
}

#[async_trait]
impl Search for LdapConnection {
    async fn search(&mut self, base: &str, filter: &str, attributes: &[String]) -> Result<Vec<DirectoryEntry>> {
        let (entries, _) = self
            .ldap
            .with_timeout(self.config.connection_timeout())
            .search(base, Scope::Subtree, filter, attributes.to_vec())
            .await?
            .success()?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| DirectoryEntry {
                dn: entry.dn,
                attributes: entry.attrs,
            })
            .collect())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(error = %e, "failed to unbind LDAP connection");
        }
    }
}

/// Builds a TLS connector trusting the system roots plus every certificate of the PEM bundle.
fn tls_connector(pem_bundle: &str) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    for pem in split_pem_bundle(pem_bundle) {
        builder.add_root_certificate(Certificate::from_pem(pem.as_bytes())?);
    }
    Ok(builder.build()?)
}

fn split_pem_bundle(bundle: &str) -> Vec<&str> {
    let mut certificates = Vec::new();
    let mut rest = bundle;
    while let Some(end) = rest.find(PEM_END) {
        let (certificate, remainder) = rest.split_at(end + PEM_END.len());
        let certificate = certificate.trim();
        if !certificate.is_empty() {
            certificates.push(certificate);
        }
        rest = remainder;
    }
    certificates
}
