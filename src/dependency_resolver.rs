//! For one `DependencyDeclaration` during a walk, chooses which concrete child instance satisfies
//! it: reuse an existing live instance, create a fresh one, or skip the edge entirely (§4.3).

use std::collections::HashSet;

use crate::error::CoreError;
use crate::graph_walker::EdgeResolution;
use crate::store::AppStore;
use crate::types::{AppDependencyConfig, CreatePolicy, DependencyDeclaration, InstanceId, AppInstance};

/// Outcome of `DependencyResolver::find_needed_app` (§4.3 step 2).
pub enum ReuseOutcome {
    /// An existing live instance satisfies the declaration.
    Found(AppInstance),
    /// `specific_instance_id` was set but doesn't resolve to a live instance.
    NotFound,
    /// No existing instance qualifies; a fresh one should be created.
    Create,
    /// No existing instance qualifies and the policy forbids creation.
    Skip,
}

pub struct DependencyResolver<'a> {
    store: &'a dyn AppStore,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(store: &'a dyn AppStore) -> Self {
        Self { store }
    }

    /// §4.3 step 1: pick one alternative. With a single alternative there's nothing to choose;
    /// otherwise prefer the first alternative whose `app_id` has a live instance with no
    /// referring parents (the most reusable, "lonely" candidate), else fall back to the first.
    pub fn choose_alternative(&self, alternatives: &[AppDependencyConfig]) -> usize {
        if alternatives.len() <= 1 {
            return 0;
        }
        for (index, alternative) in alternatives.iter().enumerate() {
            if let Some(app_id) = alternative.app_id.as_deref() {
                if self.has_lonely_instance(app_id) {
                    return index;
                }
            }
        }
        0
    }

    /// True if some live instance of `app_id` currently has zero referring parents.
    pub fn has_lonely_instance(&self, app_id: &str) -> bool {
        self.store
            .instances_of_app(app_id)
            .iter()
            .any(|instance| self.is_lonely(instance.instance_id))
    }

    /// True if no live instance currently declares a dependency edge pointing at `instance_id`.
    pub fn is_lonely(&self, instance_id: InstanceId) -> bool {
        self.store
            .get_apps_with_dependency_to(instance_id)
            .is_empty()
    }

    /// §4.3 step 2.
    pub fn find_needed_app(
        &self,
        alternative: &AppDependencyConfig,
        create_policy: CreatePolicy,
    ) -> ReuseOutcome {
        if let Some(specific_id) = alternative.specific_instance_id {
            return match self.store.get_instance_by_id(specific_id) {
                Ok(instance) => ReuseOutcome::Found(instance),
                Err(_) => ReuseOutcome::NotFound,
            };
        }

        let Some(app_id) = alternative.app_id.as_deref() else {
            return ReuseOutcome::NotFound;
        };
        let mut instances = self.store.instances_of_app(app_id);

        match create_policy {
            CreatePolicy::Always => {
                match instances
                    .drain(..)
                    .find(|instance| self.is_lonely(instance.instance_id))
                {
                    Some(instance) => ReuseOutcome::Found(instance),
                    None => ReuseOutcome::Create,
                }
            }
            CreatePolicy::IfNotExisting => match instances.into_iter().next() {
                Some(instance) => ReuseOutcome::Found(instance),
                None => ReuseOutcome::Create,
            },
            CreatePolicy::Never => match instances.into_iter().next() {
                Some(instance) => ReuseOutcome::Found(instance),
                None => ReuseOutcome::Skip,
            },
        }
    }

    /// §4.3 step 3. `promised` tracks instance ids already claimed earlier in this same walk, so
    /// a single live instance isn't wired up as the target of two different edges. `fresh_id` is
    /// the id to use if this edge turns out to need a brand new instance.
    pub fn include_edge(
        &self,
        alternative: &AppDependencyConfig,
        decl: &DependencyDeclaration,
        promised: &mut HashSet<InstanceId>,
        fresh_id: InstanceId,
    ) -> Result<EdgeResolution, CoreError> {
        match self.find_needed_app(alternative, decl.create_policy) {
            ReuseOutcome::NotFound | ReuseOutcome::Skip => Ok(EdgeResolution::NotIncluded),
            ReuseOutcome::Create => {
                let app_id = alternative.app_id.clone().ok_or_else(|| {
                    CoreError::internal("creation requested without an app_id alternative")
                })?;
                let app = self.store.get_app_by_id(&app_id)?;
                let mut properties = alternative.initial_properties.clone();
                for (key, value) in &alternative.properties {
                    properties.insert(key.clone(), value.clone());
                }
                promised.insert(fresh_id);
                Ok(EdgeResolution::IncludeWithDependencies {
                    instance_id: fresh_id,
                    app: Box::new(app),
                    alias: alternative.alias.clone(),
                    properties,
                })
            }
            ReuseOutcome::Found(instance) => {
                if promised.contains(&instance.instance_id) {
                    Ok(EdgeResolution::NotIncluded)
                } else {
                    promised.insert(instance.instance_id);
                    Ok(EdgeResolution::IncludeOnlyApp {
                        instance: Box::new(instance),
                    })
                }
            }
        }
    }
}
