//! Parsing and building of principal IDs.
//!
//! A principal ID has the shape `scheme://value`, e.g. `local://u-fydcaomakf` or
//! `activedirectory_user://CN=testuser1,CN=Users,DC=qa,DC=rancher,DC=space`.

use tracing::error;

use crate::error::Error;
use crate::error::Result;
use crate::resources::User;

pub const ACTIVE_DIRECTORY_PROVIDER: &str = "activedirectory";
pub const ACTIVE_DIRECTORY_SCOPE: &str = "activedirectory_user";
pub const ACTIVE_DIRECTORY_PREFIX: &str = "activedirectory_user://";
pub const LOCAL_PREFIX: &str = "local://";

const SEPARATOR: &str = "://";

pub(crate) const IDENTIFY_AD_USER_OPERATION: &str = "identify-ad-users";

fn split(principal_id: &str) -> Result<(&str, &str)> {
    let mut parts = principal_id.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scope), Some(external_id), None) => Ok((scope, external_id)),
        _ => Err(Error::InvalidPrincipal(principal_id.to_owned())),
    }
}

/// Returns the scheme of a principal ID, e.g. `activedirectory_user`.
pub fn scope(principal_id: &str) -> Result<&str> {
    split(principal_id).map(|(scope, _)| scope)
}

/// Returns the value of a principal ID, e.g. the GUID or distinguished name of an AD user.
pub fn external_id(principal_id: &str) -> Result<&str> {
    split(principal_id).map(|(_, external_id)| external_id)
}

/// Whether the value of the principal ID is a GUID as serialized by Rancher 2.7.5: lowercase hex without
/// any delimiters. This differs from the usual Active Directory notation with dashes and braces.
pub fn is_guid(principal_id: &str) -> bool {
    match external_id(principal_id) {
        Ok(value) => !value.is_empty() && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')),
        Err(e) => {
            error!(operation = IDENTIFY_AD_USER_OPERATION, error = %e, "failed to parse invalid principal ID");
            false
        }
    }
}

/// Turns a GUID string into the escaped form needed to filter on `objectGUID`, which is stored as binary.
///
/// A backslash is put in front of the string and after every second character, except at the very end:
/// `953d82a0` becomes `\95\3d\82\a0`.
pub fn escape_uuid(guid: &str) -> String {
    let last = guid.len().saturating_sub(1);
    let mut escaped = String::with_capacity(guid.len() + guid.len() / 2 + 1);
    escaped.push('\\');
    for (i, c) in guid.char_indices() {
        escaped.push(c);
        if i % 2 == 1 && i != last {
            escaped.push('\\');
        }
    }
    escaped
}

pub fn active_directory_principal(value: &str) -> String {
    format!("{ACTIVE_DIRECTORY_PREFIX}{value}")
}

pub fn local_principal(user_name: &str) -> String {
    format!("{LOCAL_PREFIX}{user_name}")
}

pub fn is_active_directory_principal(principal_id: &str) -> bool {
    principal_id.starts_with(ACTIVE_DIRECTORY_PREFIX)
}

/// Whether the user has logged in through Active Directory at least once.
pub fn is_ad_user(user: &User) -> bool {
    user.principal_ids.iter().any(|id| is_active_directory_principal(id))
}

/// The first Active Directory principal ID of a user.
pub fn ad_principal_id(user: &User) -> Option<&str> {
    user.principal_ids
        .iter()
        .map(String::as_str)
        .find(|id| is_active_directory_principal(id))
}
