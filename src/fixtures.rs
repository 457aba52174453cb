//! In-memory implementations of the four external traits (`AppStore`, `Validator`,
//! `ComponentRegistry`, `Translator`) and a test-observable `Aggregator`, used by this crate's own
//! test suite and by the `cli` demo binary. None of this ships to a real deployment (§1 Non-goals);
//! a real system supplies its own persistence, validator, and component registry.

use std::cell::RefCell;
use std::collections::HashSet;

use indexmap::IndexMap;

use crate::aggregator::Aggregator;
use crate::error::CoreError;
use crate::store::{AppStore, ComponentRegistry, Translator, Validator, ValidatorStatus};
use crate::types::{App, AppConfiguration, AppInstance, ComponentDefinition, InstanceId};

/// A fixed catalog of `App`s plus a mutable bag of live `AppInstance`s, queried the naive way (full
/// scans) since fixture stores only ever hold a handful of entries in tests. Built up via
/// `add_app`/`add_instance` before being handed to a `TransactionPlanner`, never mutated after.
#[derive(Default)]
pub struct FixtureStore {
    apps: IndexMap<String, App>,
    instances: IndexMap<InstanceId, AppInstance>,
}

impl FixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_app(&mut self, app: App) {
        self.apps.insert(app.app_id.clone(), app);
    }

    pub fn add_instance(&mut self, instance: AppInstance) {
        self.instances.insert(instance.instance_id, instance);
    }
}

impl AppStore for FixtureStore {
    fn get_app_by_id(&self, app_id: &str) -> Result<App, CoreError> {
        self.apps
            .get(app_id)
            .cloned()
            .ok_or_else(|| CoreError::AppNotFound {
                app_id: app_id.to_string(),
            })
    }

    fn get_instance_by_id(&self, instance_id: InstanceId) -> Result<AppInstance, CoreError> {
        self.instances
            .get(&instance_id)
            .cloned()
            .ok_or(CoreError::InstanceNotFound { instance_id })
    }

    fn get_apps_with_dependency_to(&self, instance_id: InstanceId) -> Vec<AppInstance> {
        self.instances
            .values()
            .filter(|instance| instance.dependencies.iter().any(|d| d.instance_id == instance_id))
            .cloned()
            .collect()
    }

    fn instances_of_app(&self, app_id: &str) -> Vec<AppInstance> {
        self.instances
            .values()
            .filter(|instance| instance.app_id == app_id)
            .cloned()
            .collect()
    }

    fn live_instances(&self) -> Vec<AppInstance> {
        self.instances.values().cloned().collect()
    }
}

/// Always reports an app as installable, for tests that don't exercise validator rejection.
pub struct AlwaysInstallable;

impl Validator for AlwaysInstallable {
    fn status(&self, _app: &App) -> ValidatorStatus {
        ValidatorStatus::Installable
    }

    fn message(&self, _app: &App, _status: ValidatorStatus) -> Option<String> {
        None
    }
}

/// Reports a fixed status for every app, for tests that exercise validator rejection paths.
pub struct FixedValidator(pub ValidatorStatus);

impl Validator for FixedValidator {
    fn status(&self, _app: &App) -> ValidatorStatus {
        self.0
    }

    fn message(&self, app: &App, status: ValidatorStatus) -> Option<String> {
        Some(format!("{} is {status} per fixture configuration", app.app_id))
    }
}

/// A component registry backed by a plain map, with sequential id allocation.
#[derive(Default)]
pub struct FixtureComponentRegistry {
    components: RefCell<IndexMap<String, ComponentDefinition>>,
}

impl FixtureComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, component: ComponentDefinition) {
        self.components.borrow_mut().insert(component.id.clone(), component);
    }
}

impl ComponentRegistry for FixtureComponentRegistry {
    fn get_component(&self, id: &str) -> Option<ComponentDefinition> {
        self.components.borrow().get(id).cloned()
    }

    fn get_component_by_config(&self, spec: &ComponentDefinition) -> Option<String> {
        self.components
            .borrow()
            .values()
            .find(|existing| {
                existing.factory_id == spec.factory_id && existing.properties == spec.properties
            })
            .map(|existing| existing.id.clone())
    }

    fn next_available_id(&self, base: &str, start: u32, claimed: &HashSet<String>) -> String {
        let components = self.components.borrow();
        let mut n = start;
        loop {
            let candidate = format!("{base}{n}");
            if !claimed.contains(&candidate) && !components.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Echoes `key` with its args appended, standing in for a real locale catalog.
pub struct EchoTranslator;

impl Translator for EchoTranslator {
    fn translate(&self, _locale: &str, key: &str, args: &[&str]) -> String {
        if args.is_empty() {
            key.to_string()
        } else {
            format!("{key}({})", args.join(", "))
        }
    }
}

/// Records every `aggregate`/`commit` call it receives, so tests can assert on what a
/// `TransactionPlanner` sent a downstream subsystem. Optionally configured to fail `commit`, to
/// exercise the lenient multi-aggregator rollback path.
pub struct RecordingAggregator {
    name: &'static str,
    fail_commit: bool,
    aggregate_calls: RefCell<Vec<(Option<AppConfiguration>, Option<AppConfiguration>)>>,
    commits: RefCell<Vec<(String, usize)>>,
}

impl RecordingAggregator {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail_commit: false,
            aggregate_calls: RefCell::new(Vec::new()),
            commits: RefCell::new(Vec::new()),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail_commit: true,
            ..Self::new(name)
        }
    }

    pub fn aggregate_call_count(&self) -> usize {
        self.aggregate_calls.borrow().len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.borrow().len()
    }
}

impl Aggregator for RecordingAggregator {
    fn reset(&mut self) {
        self.aggregate_calls.borrow_mut().clear();
    }

    fn aggregate(&mut self, new_config: Option<&AppConfiguration>, old_config: Option<&AppConfiguration>) {
        self.aggregate_calls
            .borrow_mut()
            .push((new_config.cloned(), old_config.cloned()));
    }

    fn commit(&mut self, user: &str, other_app_configs: &[AppInstance]) -> Result<(), CoreError> {
        self.commits
            .borrow_mut()
            .push((user.to_string(), other_app_configs.len()));
        if self.fail_commit {
            return Err(CoreError::AggregatorFailed {
                aggregator: self.name,
                message: "fixture configured to fail".to_string(),
                source: None,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dependency, ValidatorConfig};
    use indexmap::IndexSet;
    use uuid::Uuid;

    fn sample_app(app_id: &str) -> App {
        App::new(
            app_id,
            Vec::new(),
            IndexSet::new(),
            ValidatorConfig::default(),
            |_target, _alias, _properties, _language| {
                Ok(AppConfiguration::default())
            },
        )
    }

    #[test]
    fn get_apps_with_dependency_to_scans_all_instances() {
        let mut store = FixtureStore::new();
        store.add_app(sample_app("Meter"));
        store.add_app(sample_app("BatteryMonitor"));
        let meter_id = Uuid::new_v4();
        let bm_id = Uuid::new_v4();
        store.add_instance(AppInstance::new(meter_id, "Meter"));
        store.add_instance(
            AppInstance::new(bm_id, "BatteryMonitor")
                .with_dependencies(vec![Dependency::new("meter", meter_id)]),
        );

        let referrers = store.get_apps_with_dependency_to(meter_id);
        assert_eq!(referrers.len(), 1);
        assert_eq!(referrers[0].instance_id, bm_id);
    }

    #[test]
    fn registry_allocates_sequential_ids_skipping_claimed() {
        let registry = FixtureComponentRegistry::new();
        registry.insert(ComponentDefinition {
            id: "meter0".into(),
            factory_id: "meter-factory".into(),
            alias: None,
            properties: Default::default(),
        });
        let mut claimed = HashSet::new();
        claimed.insert("meter1".to_string());

        let next = registry.next_available_id("meter", 0, &claimed);
        assert_eq!(next, "meter2");
    }

    #[test]
    fn recording_aggregator_tracks_calls() {
        let mut aggregator = RecordingAggregator::new("components");
        aggregator.aggregate(Some(&AppConfiguration::default()), None);
        assert_eq!(aggregator.aggregate_call_count(), 1);
        aggregator.commit("alice", &[]).unwrap();
        assert_eq!(aggregator.commit_count(), 1);
        aggregator.reset();
        assert_eq!(aggregator.aggregate_call_count(), 0);
    }

    #[test]
    fn failing_aggregator_reports_configured_error() {
        let mut aggregator = RecordingAggregator::failing("scheduler");
        let err = aggregator.commit("alice", &[]).unwrap_err();
        assert!(matches!(err, CoreError::AggregatorFailed { .. }));
    }
}
