//! The immutable data model: catalog apps, live instances, dependency declarations, and the
//! per-request transaction scratch. Values here are cheap to clone and compared by identity
//! (`instanceId`) rather than structural equality where the spec calls for it.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Ordered property bag carried by both catalog property overrides and live instances.
pub type Properties = IndexMap<String, JsonValue>;

/// Stable identity of an `AppInstance`. Never reused across the lifetime of an `AppStore`.
pub type InstanceId = Uuid;

/// Stable identity of a catalog `App`.
pub type AppId = String;

/// Locale/language tag passed through to `App::render` and `Translator::translate`.
pub type Language = String;

/// Target the caller asked for, passed to `App::render` so a catalog app can render differently
/// depending on whether the result will be installed, updated in place, torn down, or only probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ConfigurationTarget {
    #[strum(to_string = "ADD")]
    Add,
    #[strum(to_string = "UPDATE")]
    Update,
    #[strum(to_string = "DELETE")]
    Delete,
    #[strum(to_string = "TEST")]
    Test,
}

/// Governs whether a dependency declaration may be satisfied by creating a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreatePolicy {
    Always,
    IfNotExisting,
    Never,
}

/// Governs whether a parent may rewrite a child instance's properties during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePolicy {
    Always,
    Never,
    IfMine,
}

/// Governs whether a parent's delete cascades to a child instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletePolicy {
    Always,
    Never,
    IfMine,
}

/// Governs which properties a *child* may override when its parent also sets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyUpdatePolicy {
    AllowAll,
    AllowNone,
    AllowOnlyUnconfiguredProperties,
}

/// Governs whether a child may be deleted independently while this parent still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyDeletePolicy {
    Allowed,
    NotAllowed,
}

/// One alternative way to satisfy a `DependencyDeclaration`: either a specific already-known
/// instance, or an app id to be resolved against the live graph (reuse or create).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDependencyConfig {
    /// Exactly one of `app_id`/`specific_instance_id` is set; see `AppDependencyConfig::target`.
    pub app_id: Option<AppId>,
    pub specific_instance_id: Option<InstanceId>,
    pub alias: Option<String>,
    /// Merged onto the child's properties regardless of creation or reuse.
    pub properties: Properties,
    /// Applied only when this alternative results in a freshly created instance.
    pub initial_properties: Properties,
}

impl AppDependencyConfig {
    pub fn by_app(app_id: impl Into<AppId>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            specific_instance_id: None,
            alias: None,
            properties: Properties::new(),
            initial_properties: Properties::new(),
        }
    }

    pub fn by_instance(instance_id: InstanceId) -> Self {
        Self {
            app_id: None,
            specific_instance_id: Some(instance_id),
            alias: None,
            properties: Properties::new(),
            initial_properties: Properties::new(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_initial_properties(mut self, properties: Properties) -> Self {
        self.initial_properties = properties;
        self
    }
}

/// One dependency slot on a catalog `App`, addressed by `key`. `alternatives` is ordered and
/// non-empty; the first entry is the default used when there's only one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDeclaration {
    pub key: String,
    pub alternatives: Vec<AppDependencyConfig>,
    pub create_policy: CreatePolicy,
    pub update_policy: UpdatePolicy,
    pub delete_policy: DeletePolicy,
    pub dependency_update_policy: DependencyUpdatePolicy,
    pub dependency_delete_policy: DependencyDeletePolicy,
}

impl DependencyDeclaration {
    /// True if any alternative names `app_id` as a reuse/create target.
    pub fn declares_app(&self, app_id: &str) -> bool {
        self.alternatives
            .iter()
            .any(|alt| alt.app_id.as_deref() == Some(app_id))
    }
}

/// A dependency edge stored on a live `AppInstance`: the declaration key it satisfies, and the
/// target instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub key: String,
    pub instance_id: InstanceId,
}

impl Dependency {
    pub fn new(key: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            key: key.into(),
            instance_id,
        }
    }
}

/// A rendered component definition, part of an `AppConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub id: String,
    pub factory_id: String,
    pub alias: Option<String>,
    pub properties: Properties,
}

/// A network interface fragment contributed by a rendered `AppConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    pub interface_name: String,
    pub static_ip: Option<String>,
    pub properties: Properties,
}

/// The output of `App::render`: the set of configuration fragments one instance contributes to
/// the three downstream subsystems, plus the dependency declarations it carries forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfiguration {
    pub components: Vec<ComponentDefinition>,
    /// Scheduler execution order, as component ids.
    pub scheduler_order: Vec<String>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub dependencies: Vec<DependencyDeclaration>,
}

/// Catalog entry: immutable per version, resolved by `AppStore::get_app_by_id`.
///
/// `render` is a pure function of `(target, alias, properties, language)`; the core never
/// special-cases a particular `app_id` — all behavior differences flow through this closure and
/// through the declarations it returns.
#[derive(Clone)]
pub struct App {
    pub app_id: AppId,
    pub names: IndexMap<Language, String>,
    pub dependencies: Vec<DependencyDeclaration>,
    pub persistable_properties: IndexSet<String>,
    pub validator_config: ValidatorConfig,
    render: Arc<
        dyn Fn(ConfigurationTarget, Option<&str>, &Properties, &Language) -> RenderResult
            + Send
            + Sync,
    >,
}

/// `App::render` may fail (a catalog app's render function threw, in the source system); the
/// walker records this as a skip rather than aborting (§4.2, §7 `RenderFailed`).
pub type RenderResult = std::result::Result<AppConfiguration, String>;

impl App {
    pub fn new(
        app_id: impl Into<AppId>,
        dependencies: Vec<DependencyDeclaration>,
        persistable_properties: IndexSet<String>,
        validator_config: ValidatorConfig,
        render: impl Fn(ConfigurationTarget, Option<&str>, &Properties, &Language) -> RenderResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            names: IndexMap::new(),
            dependencies,
            persistable_properties,
            validator_config,
            render: Arc::new(render),
        }
    }

    pub fn is_persistable(&self, property: &str) -> bool {
        self.persistable_properties.contains(property)
    }

    pub fn declaration(&self, key: &str) -> Option<&DependencyDeclaration> {
        self.dependencies.iter().find(|d| d.key == key)
    }

    pub fn render(
        &self,
        target: ConfigurationTarget,
        alias: Option<&str>,
        properties: &Properties,
        language: &Language,
    ) -> RenderResult {
        (self.render)(target, alias, properties, language)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("app_id", &self.app_id).finish_non_exhaustive()
    }
}

/// Opaque validator configuration, forwarded unexamined to `Validator::status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub compatibility_keys: Vec<String>,
}

/// A specific installation of an `App`. Equality and hashing are by `instance_id` alone, matching
/// the spec's "equality is by instanceId" rule.
#[derive(Debug, Clone)]
pub struct AppInstance {
    pub instance_id: InstanceId,
    pub app_id: AppId,
    pub alias: Option<String>,
    pub properties: Properties,
    pub dependencies: Vec<Dependency>,
}

impl AppInstance {
    pub fn new(instance_id: InstanceId, app_id: impl Into<AppId>) -> Self {
        Self {
            instance_id,
            app_id: app_id.into(),
            alias: None,
            properties: Properties::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn dependency(&self, key: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.key == key)
    }
}

impl PartialEq for AppInstance {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}
impl Eq for AppInstance {}

impl std::hash::Hash for AppInstance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.instance_id.hash(state);
    }
}

/// A non-fatal message accumulated during a walk and returned with `UpdateValues` on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub instance_id: Option<InstanceId>,
    pub message: String,
}

impl Warning {
    pub fn new(instance_id: Option<InstanceId>, message: impl Into<String>) -> Self {
        Self {
            instance_id,
            message: message.into(),
        }
    }
}

/// Result of an `install`/`update`/`delete` request, per §6.
#[derive(Debug, Clone, Default)]
pub struct UpdateValues {
    pub root: Option<AppInstance>,
    pub created_or_modified: Vec<AppInstance>,
    pub deleted: Vec<AppInstance>,
    pub warnings: Vec<Warning>,
}
