//! In-memory stand-ins for the cluster and the directory.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::TimeZone;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ClusterResourceScope;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use serde_json::json;
use serde_json::Value;

use crate::directory::LookupUser;
use crate::error::Error;
use crate::error::Result;
use crate::k8s::ManageResources;
use crate::principal::active_directory_principal;
use crate::resources::KubeObject;
use crate::resources::Principal;
use crate::resources::User;

pub const GUID: &str = "953d82a03d47a5498330293e386dfce1";
pub const DN: &str = "CN=testuser1,CN=Users,DC=qa,DC=rancher,DC=space";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Get,
    Create,
    Replace,
    Delete,
    Annotate,
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    generated: u32,
    failures: HashMap<(String, Verb), (u32, u16)>,
    calls: Vec<String>,
}

/// A cluster that keeps objects as JSON, the way the api server would hand them out.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: message.to_owned(),
            reason: reason.to_owned(),
            code,
        }),
    }
}

fn reason_for(code: u16) -> &'static str {
    match code {
        404 => "NotFound",
        409 => "AlreadyExists",
        403 => "Forbidden",
        500 => "InternalError",
        _ => "BadRequest",
    }
}

fn scoped_namespace<R: KubeObject>(namespace: Option<&str>) -> String {
    if TypeId::of::<R::Scope>() == TypeId::of::<ClusterResourceScope>() {
        String::new()
    } else {
        namespace.unwrap_or_default().to_owned()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster::default()
    }

    pub fn with<R: KubeObject>(self, object: R) -> Self {
        self.insert(object);
        self
    }

    pub fn insert<R: KubeObject>(&self, object: R) {
        let namespace = scoped_namespace::<R>(object.metadata().namespace.as_deref());
        let name = object.metadata().name.clone().unwrap_or_default();
        let value = serde_json::to_value(object.with_type_meta()).unwrap();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((R::KIND.to_owned(), namespace, name), value);
    }

    /// Makes the next `times` calls of `verb` on kind `R` fail with the given HTTP status code.
    pub fn fail<R: KubeObject>(&self, verb: Verb, times: u32, code: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((R::KIND.to_owned(), verb), (times, code));
    }

    /// Makes the next `times` calls fail the way an overloaded admission webhook does.
    pub fn fail_internal<R: KubeObject>(&self, verb: Verb, times: u32) {
        self.fail::<R>(verb, times, 500);
    }

    pub fn objects<R: KubeObject>(&self) -> Vec<R> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|((kind, _, _), _)| kind == R::KIND)
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect()
    }

    pub fn find<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Option<R> {
        let key = (R::KIND.to_owned(), scoped_namespace::<R>(namespace), name.to_owned());
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Mutating calls in the order they reached the cluster, e.g. `delete ClusterRoleTemplateBinding crtb-old`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn check<R: KubeObject>(&self, state: &mut State, verb: Verb) -> Result<()> {
        let key = (R::KIND.to_owned(), verb);
        let Some((times, code)) = state.failures.get_mut(&key) else {
            return Ok(());
        };
        if *times == 0 {
            return Ok(());
        }
        *times -= 1;
        Err(api_error(*code, reason_for(*code), &format!("injected {verb:?} failure for {}", R::KIND)))
    }

    fn not_found<R: KubeObject>(name: &str) -> Error {
        api_error(404, "NotFound", &format!("{} \"{name}\" not found", R::KIND))
    }
}

#[async_trait]
impl ManageResources for FakeCluster {
    async fn list<R: KubeObject>(&self) -> Result<Vec<R>> {
        {
            let mut state = self.state.lock().unwrap();
            self.check::<R>(&mut state, Verb::List)?;
        }
        Ok(self.objects())
    }

    async fn get<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<R> {
        {
            let mut state = self.state.lock().unwrap();
            self.check::<R>(&mut state, Verb::Get)?;
        }
        self.find(namespace, name).ok_or_else(|| Self::not_found::<R>(name))
    }

    async fn create<R: KubeObject>(&self, object: &R) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        self.check::<R>(&mut state, Verb::Create)?;

        let mut object = object.clone().with_type_meta();
        let meta = object.metadata_mut();
        if meta.name.as_deref().unwrap_or_default().is_empty() {
            let prefix = meta.generate_name.clone().unwrap_or_default();
            state.generated += 1;
            meta.name = Some(format!("{prefix}{:05}", state.generated));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }

        let name = meta.name.clone().unwrap_or_default();
        let key = (
            R::KIND.to_owned(),
            scoped_namespace::<R>(meta.namespace.as_deref()),
            name.clone(),
        );
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", &format!("{} \"{name}\" already exists", R::KIND)));
        }

        state.calls.push(format!("create {} {name}", R::KIND));
        state.objects.insert(key, serde_json::to_value(&object)?);
        Ok(object)
    }

    async fn replace<R: KubeObject>(&self, object: &R) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        self.check::<R>(&mut state, Verb::Replace)?;

        let name = object.metadata().name.clone().unwrap_or_default();
        let key = (
            R::KIND.to_owned(),
            scoped_namespace::<R>(object.metadata().namespace.as_deref()),
            name.clone(),
        );
        if !state.objects.contains_key(&key) {
            return Err(Self::not_found::<R>(&name));
        }

        let object = object.clone().with_type_meta();
        state.calls.push(format!("replace {} {name}", R::KIND));
        state.objects.insert(key, serde_json::to_value(&object)?);
        Ok(object)
    }

    async fn delete<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.check::<R>(&mut state, Verb::Delete)?;

        let key = (R::KIND.to_owned(), scoped_namespace::<R>(namespace), name.to_owned());
        if state.objects.remove(&key).is_none() {
            return Err(Self::not_found::<R>(name));
        }
        state.calls.push(format!("delete {} {name}", R::KIND));
        Ok(())
    }

    async fn annotate<R: KubeObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        self.check::<R>(&mut state, Verb::Annotate)?;

        let key = (R::KIND.to_owned(), scoped_namespace::<R>(namespace), name.to_owned());
        let Some(value) = state.objects.get_mut(&key) else {
            return Err(Self::not_found::<R>(name));
        };
        let metadata = value
            .as_object_mut()
            .map(|object| object.entry("metadata").or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::UserInput("stored object without metadata".to_owned()))?;
        let existing = metadata
            .entry("annotations")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| Error::UserInput("stored object with invalid annotations".to_owned()))?;
        for (key, annotation) in annotations {
            existing.insert(key.clone(), Value::String(annotation.clone()));
        }

        let object = serde_json::from_value(value.clone())?;
        state.calls.push(format!("annotate {} {name}", R::KIND));
        Ok(object)
    }
}

/// A directory with a fixed set of users that can be made to break after a number of lookups.
#[derive(Default)]
pub struct FakeDirectory {
    users: HashMap<String, String>,
    duplicates: HashSet<String>,
    healthy_lookups: Option<usize>,
    lookups: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeDirectory {
    pub fn new() -> Self {
        FakeDirectory::default()
    }

    pub fn with_user(mut self, guid: &str, dn: &str) -> Self {
        self.users.insert(guid.to_owned(), dn.to_owned());
        self
    }

    pub fn with_duplicate_guid(mut self, guid: &str) -> Self {
        self.duplicates.insert(guid.to_owned());
        self
    }

    /// Answers `lookups` lookups, every following lookup fails permanently.
    pub fn breaking_after(mut self, lookups: usize) -> Self {
        self.healthy_lookups = Some(lookups);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn directory_principal(dn: &str, login_name: &str) -> Principal {
    let mut principal = Principal {
        display_name: format!("Display {login_name}"),
        login_name: login_name.to_owned(),
        principal_type: "user".to_owned(),
        me: true,
        provider: "activedirectory".to_owned(),
        ..Default::default()
    };
    principal.metadata.name = Some(active_directory_principal(dn));
    principal
}

#[async_trait]
impl LookupUser for FakeDirectory {
    async fn find_user_with_retries(&self, guid: &str) -> Result<(String, Principal)> {
        let done = {
            let mut lookups = self.lookups.lock().unwrap();
            lookups.push(guid.to_owned());
            lookups.len() - 1
        };
        if self.healthy_lookups.is_some_and(|healthy| done >= healthy) {
            return Err(Error::LdapConnectionPermanentlyFailed);
        }
        if self.duplicates.contains(guid) {
            return Err(Error::LdapDuplicateGuid);
        }

        let dn = self.users.get(guid).ok_or(Error::LdapNotFound)?;
        let login_name = dn.split(',').next().unwrap_or_default().trim_start_matches("CN=");
        Ok((dn.clone(), directory_principal(dn, login_name)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A user created `minute` minutes into 2023-06-01 with the given principal IDs.
pub fn user(name: &str, minute: u32, principal_ids: &[&str]) -> User {
    User {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            creation_timestamp: Utc
                .with_ymd_and_hms(2023, 6, 1, 10, minute, 0)
                .single()
                .map(Time),
            ..Default::default()
        },
        principal_ids: principal_ids.iter().map(|id| (*id).to_owned()).collect(),
        ..Default::default()
    }
}

/// A user with a local and a GUID-based principal.
pub fn guid_user(name: &str, minute: u32, guid: &str) -> User {
    user(
        name,
        minute,
        &[format!("local://{name}").as_str(), active_directory_principal(guid).as_str()],
    )
}

/// A user with a local and a DN-based principal.
pub fn dn_user(name: &str, minute: u32, dn: &str) -> User {
    user(
        name,
        minute,
        &[format!("local://{name}").as_str(), active_directory_principal(dn).as_str()],
    )
}
