//! Trait boundaries for the collaborators the core consumes but never implements: the persistent
//! app catalog/instance store, the installability validator, the live component registry, and the
//! translator. Concrete implementations (a real persistence layer, a real component registry) are
//! entirely out of scope for this crate (§1); `crate::fixtures` supplies in-memory stand-ins used
//! by the test suite and the `cli` demo.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::types::{App, AppConfiguration, AppInstance, ConfigurationTarget, InstanceId, Language};

/// Outcome of `Validator::status`, per §4.4.1 step 1 and §7's `NotCompatible`/`NotInstallable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ValidatorStatus {
    Incompatible,
    Compatible,
    Installable,
}

/// The persistent catalog and live instance graph. The core treats this as a consistent snapshot
/// for the duration of one request (§5): it never mutates it directly, only through the
/// aggregators' eventual `commit`.
pub trait AppStore {
    fn get_app_by_id(&self, app_id: &str) -> Result<App, CoreError>;

    fn get_instance_by_id(&self, instance_id: InstanceId) -> Result<AppInstance, CoreError>;

    /// Live instances that currently declare a dependency edge pointing at `instance_id`.
    fn get_apps_with_dependency_to(&self, instance_id: InstanceId) -> Vec<AppInstance>;

    /// All live instances of `app_id`, in an order the store considers canonical (ties among
    /// candidates are broken by the caller per DESIGN.md's declaration-key sort, not by this
    /// method's ordering).
    fn instances_of_app(&self, app_id: &str) -> Vec<AppInstance>;

    /// Every live instance currently in the graph. Used by the planner to search for an existing
    /// parent able to adopt a newly-needed dependency (a parent declaring an unfilled slot for the
    /// child's `app_id`) when no parent was named explicitly by the walk.
    fn live_instances(&self) -> Vec<AppInstance>;

    /// Convenience wrapper around `App::render` that resolves the catalog entry first; equivalent
    /// to `get_app_by_id(&instance.app_id)?.render(...)`.
    fn get_app_configuration(
        &self,
        instance: &AppInstance,
        target: ConfigurationTarget,
        language: &Language,
    ) -> Result<AppConfiguration, CoreError> {
        let app = self.get_app_by_id(&instance.app_id)?;
        app.render(
            target,
            instance.alias.as_deref(),
            &instance.properties,
            language,
        )
        .map_err(|message| CoreError::RenderFailed {
            instance_id: instance.instance_id,
            message,
            source: None,
        })
    }
}

/// The compatibility/installability checker.
pub trait Validator {
    fn status(&self, app: &App) -> ValidatorStatus;

    /// A developer-facing reason, present when `status` isn't `Installable`.
    fn message(&self, app: &App, status: ValidatorStatus) -> Option<String>;
}

/// The live component registry the `IdReconciler` consults and allocates from.
pub trait ComponentRegistry {
    fn get_component(&self, id: &str) -> Option<crate::types::ComponentDefinition>;

    /// Looks up a component whose `factory_id`/`properties` (ignoring `id`) exactly match `spec`,
    /// returning its id if one exists.
    fn get_component_by_config(&self, spec: &crate::types::ComponentDefinition) -> Option<String>;

    /// Allocates the next unused id of the form `{base}{digits}`, starting the digit search at
    /// `start`, skipping any id in `claimed` in addition to ids already present in the registry.
    fn next_available_id(&self, base: &str, start: u32, claimed: &HashSet<String>) -> String;
}

/// Locale-aware message rendering, used for the user-facing half of error/warning messages (§10).
pub trait Translator {
    fn translate(&self, locale: &str, key: &str, args: &[&str]) -> String;
}
