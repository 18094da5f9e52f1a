//! Typed views of the Rancher management objects touched by the migration.
//!
//! Rancher keeps the payload of these objects next to `metadata` instead of below `spec`, so they are
//! declared by hand rather than through `kube::CustomResource`. Every type keeps the fields it does not
//! know about in `extra`, so replacing an object never drops data.

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use k8s_openapi::ListableResource;
use k8s_openapi::Metadata;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::Resource;
use kube::core::TypeMeta;
use kube::Api;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

const MANAGEMENT_GROUP: &str = "management.cattle.io";
const MANAGEMENT_VERSION: &str = "v3";
const MANAGEMENT_API_VERSION: &str = "management.cattle.io/v3";

/// An object the migration reads or writes through the Kubernetes API.
pub trait KubeObject:
    Resource + Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// Returns an [Api] for the object, scoped to `namespace` for namespaced kinds.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    /// Makes sure `apiVersion` and `kind` are present when the object is serialized.
    fn with_type_meta(self) -> Self {
        self
    }
}

fn type_meta<K: Resource>() -> TypeMeta {
    TypeMeta {
        api_version: K::API_VERSION.to_owned(),
        kind: K::KIND.to_owned(),
    }
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

macro_rules! management_resource {
    ($kind:ident, $plural:literal, cluster) => {
        management_resource!(@meta $kind, $plural, ClusterResourceScope);

        impl KubeObject for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }

            fn with_type_meta(mut self) -> Self {
                self.types = Some(type_meta::<Self>());
                self
            }
        }
    };
    ($kind:ident, $plural:literal, namespaced) => {
        management_resource!(@meta $kind, $plural, NamespaceResourceScope);

        impl KubeObject for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                namespaced_api(client, namespace)
            }

            fn with_type_meta(mut self) -> Self {
                self.types = Some(type_meta::<Self>());
                self
            }
        }
    };
    (@meta $kind:ident, $plural:literal, $scope:ty) => {
        impl Resource for $kind {
            const API_VERSION: &'static str = MANAGEMENT_API_VERSION;
            const GROUP: &'static str = MANAGEMENT_GROUP;
            const KIND: &'static str = stringify!($kind);
            const VERSION: &'static str = MANAGEMENT_VERSION;
            const URL_PATH_SEGMENT: &'static str = $plural;
            type Scope = $scope;
        }

        impl ListableResource for $kind {
            const LIST_KIND: &'static str = concat!(stringify!($kind), "List");
        }

        impl Metadata for $kind {
            type Ty = ObjectMeta;

            fn metadata(&self) -> &Self::Ty {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Self::Ty {
                &mut self.metadata
            }
        }
    };
}

/// A Rancher user. `principal_ids` links the user to its identities, local and external.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principal_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl User {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|time| time.0)
    }
}

management_resource!(User, "users", cluster);

/// An identity as reported by an auth provider. Its ID lives in `metadata.name`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub principal_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub me: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub member_of: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Principal {
    pub fn id(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

/// An API token issued to a user at login.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default)]
    pub user_principal: Principal,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_provider: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

management_resource!(Token, "tokens", cluster);

/// Grants a role template on a cluster. Lives in the namespace of the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleTemplateBinding {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_principal_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_template_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

management_resource!(ClusterRoleTemplateBinding, "clusterroletemplatebindings", namespaced);

/// Grants a role template on a project. Lives in the namespace of the project.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRoleTemplateBinding {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_principal_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_template_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

management_resource!(ProjectRoleTemplateBinding, "projectroletemplatebindings", namespaced);

/// Grants a global role. Global role bindings reference users by name only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRoleBinding {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global_role_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_principal_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

management_resource!(GlobalRoleBinding, "globalrolebindings", cluster);

/// Configuration of an auth provider. Its shape depends on the provider, so it is kept unstructured.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AuthConfig {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

management_resource!(AuthConfig, "authconfigs", cluster);

impl KubeObject for ConfigMap {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }
}

impl KubeObject for Secret {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }
}
