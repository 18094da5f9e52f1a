use std::fmt::Debug;

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Reason reported by the api server when an admission webhook (or the server itself) failed internally.
const REASON_INTERNAL_ERROR: &str = "InternalError";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    /// Any error originating from the LDAP client, including connection and bind failures
    #[error("LDAP reported error: {source}")]
    Ldap {
        #[from]
        source: ldap3::LdapError,
    },
    #[error("Failed to build TLS connector: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("ldap query returned no results")]
    LdapNotFound,
    /// Either a configuration error or a corruption on the Active Directory side.
    #[error("ldap query returned multiple users for the same GUID")]
    LdapDuplicateGuid,
    #[error("ldap search failed to connect after exhausting maximum retry attempts")]
    LdapConnectionPermanentlyFailed,
    #[error("failed to generate principal from ldap attributes of '{0}'")]
    PrincipalAttributes(String),
    #[error("invalid principal ID '{0}'")]
    InvalidPrincipal(String),
    #[error("invalid Active Directory configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    UserInput(String),
    #[error("Unnamed k8s object")]
    UnnamedObject,
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<Error>,
    },
    #[error("Failed to (de)serialize object: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Whether the api server answered with 404 for the requested object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(response) } if response.code == 404)
    }

    /// Whether the api server (or one of its admission webhooks) failed internally. These failures are
    /// usually caused by load and are worth retrying.
    pub fn is_internal(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(response),
            } => response.reason == REASON_INTERNAL_ERROR || response.code == 500,
            _ => false,
        }
    }

    /// Whether the directory gave a definitive answer for a lookup, as opposed to a failure of the session.
    pub fn is_definitive_ldap_answer(&self) -> bool {
        matches!(self, Error::LdapNotFound | Error::LdapDuplicateGuid)
    }
}
