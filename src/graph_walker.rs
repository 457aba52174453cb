//! Post-order, cycle-safe traversal in the two modes spec §4.2 calls for: `walk_desired` descends
//! an app's *declared* dependency tree (resolving each edge via caller-supplied callbacks),
//! `walk_existing` descends an installed instance's *stored* dependency edges. Both guarantee that
//! by the time `on_node` fires for a node, it has already fired (and returned) for every included
//! dependency of that node — siblings are visited in declaration order.

use indexmap::IndexSet;

use crate::error::CoreError;
use crate::store::AppStore;
use crate::types::{
    App, AppConfiguration, AppDependencyConfig, AppInstance, ConfigurationTarget, Dependency,
    DependencyDeclaration, InstanceId, Language, Properties, Warning,
};

/// What `include_edge` decided for one declaration alternative, per §4.3 step 3.
pub enum EdgeResolution {
    /// Nothing satisfies this declaration and creation isn't permitted (or was already promised
    /// earlier in this walk) — the edge is dropped entirely.
    NotIncluded,
    /// An existing live instance satisfies this declaration; reuse its subgraph as-is without
    /// descending into it again.
    IncludeOnlyApp { instance: Box<AppInstance> },
    /// No existing instance satisfies this declaration (or the policy demands a fresh one); a
    /// tentative instance has been registered under `instance_id` and its subtree must be walked.
    IncludeWithDependencies {
        instance_id: InstanceId,
        app: Box<App>,
        alias: Option<String>,
        properties: Properties,
    },
}

/// A node visited by `walk_desired`, handed to `on_node` post-order.
pub struct DesiredWalkNode {
    pub instance_id: InstanceId,
    pub app_id: String,
    pub alias: Option<String>,
    pub properties: Properties,
    pub configuration: AppConfiguration,
    pub parent_instance_id: Option<InstanceId>,
    pub parent_app_id: Option<crate::types::AppId>,
    pub declaration_key: Option<String>,
    /// `true` for a tentative fresh instance (`IncludeWithDependencies`); `false` for the root or
    /// for a reused existing subgraph (`IncludeOnlyApp`).
    pub created: bool,
    /// Dependency edges resolved for this node's own declarations (empty for reused subgraphs,
    /// whose existing `dependencies` list is left untouched).
    pub resolved_dependencies: Vec<Dependency>,
}

#[allow(clippy::too_many_arguments)]
pub fn walk_desired(
    store: &dyn AppStore,
    root_app: &App,
    root_instance_id: InstanceId,
    root_alias: Option<&str>,
    root_properties: &Properties,
    target: ConfigurationTarget,
    language: &Language,
    warnings: &mut Vec<Warning>,
    choose_alternative: &mut dyn FnMut(&[AppDependencyConfig]) -> usize,
    include_edge: &mut dyn FnMut(&App, &DependencyDeclaration, &AppDependencyConfig) -> EdgeResolution,
    on_node: &mut dyn FnMut(&DesiredWalkNode) -> Result<bool, CoreError>,
) -> Result<Option<DesiredWalkNode>, CoreError> {
    let mut visited = IndexSet::new();
    walk_desired_node(
        store,
        root_app,
        root_instance_id,
        root_alias,
        root_properties,
        true,
        None,
        None,
        None,
        target,
        language,
        warnings,
        &mut visited,
        choose_alternative,
        include_edge,
        on_node,
    )
}

#[allow(clippy::too_many_arguments)]
fn walk_desired_node(
    store: &dyn AppStore,
    app: &App,
    instance_id: InstanceId,
    alias: Option<&str>,
    properties: &Properties,
    created: bool,
    parent_instance_id: Option<InstanceId>,
    parent_app_id: Option<crate::types::AppId>,
    declaration_key: Option<String>,
    target: ConfigurationTarget,
    language: &Language,
    warnings: &mut Vec<Warning>,
    visited: &mut IndexSet<InstanceId>,
    choose_alternative: &mut dyn FnMut(&[AppDependencyConfig]) -> usize,
    include_edge: &mut dyn FnMut(&App, &DependencyDeclaration, &AppDependencyConfig) -> EdgeResolution,
    on_node: &mut dyn FnMut(&DesiredWalkNode) -> Result<bool, CoreError>,
) -> Result<Option<DesiredWalkNode>, CoreError> {
    if !visited.insert(instance_id) {
        return Ok(None);
    }

    let mut resolved_dependencies = Vec::new();

    if created {
        for decl in &app.dependencies {
            if decl.alternatives.is_empty() {
                continue;
            }
            let alt_index = choose_alternative(&decl.alternatives);
            let alternative = &decl.alternatives[alt_index];
            match include_edge(app, decl, alternative) {
                EdgeResolution::NotIncluded => continue,
                EdgeResolution::IncludeOnlyApp { instance } => {
                    let child_config = match store.get_app_configuration(&instance, target, language) {
                        Ok(cfg) => cfg,
                        Err(err) => {
                            warnings.push(Warning::new(
                                Some(instance.instance_id),
                                format!("skipped reused dependency: {err}"),
                            ));
                            continue;
                        }
                    };
                    let child_node = DesiredWalkNode {
                        instance_id: instance.instance_id,
                        app_id: instance.app_id.clone(),
                        alias: instance.alias.clone(),
                        properties: instance.properties.clone(),
                        configuration: child_config,
                        parent_instance_id: Some(instance_id),
                        parent_app_id: Some(app.app_id.clone()),
                        declaration_key: Some(decl.key.clone()),
                        created: false,
                        resolved_dependencies: instance.dependencies.clone(),
                    };
                    if on_node(&child_node)? {
                        resolved_dependencies
                            .push(Dependency::new(decl.key.clone(), instance.instance_id));
                    }
                }
                EdgeResolution::IncludeWithDependencies {
                    instance_id: child_id,
                    app: child_app,
                    alias: child_alias,
                    properties: child_properties,
                } => {
                    let child_node = walk_desired_node(
                        store,
                        &child_app,
                        child_id,
                        child_alias.as_deref(),
                        &child_properties,
                        true,
                        Some(instance_id),
                        Some(app.app_id.clone()),
                        Some(decl.key.clone()),
                        target,
                        language,
                        warnings,
                        visited,
                        choose_alternative,
                        include_edge,
                        on_node,
                    )?;
                    if child_node.is_some() {
                        resolved_dependencies.push(Dependency::new(decl.key.clone(), child_id));
                    }
                }
            }
        }
    }

    let configuration = match app.render(target, alias, properties, language) {
        Ok(cfg) => cfg,
        Err(message) => {
            warnings.push(Warning::new(Some(instance_id), format!("render failed: {message}")));
            return Ok(None);
        }
    };

    let node = DesiredWalkNode {
        instance_id,
        app_id: app.app_id.clone(),
        alias: alias.map(String::from),
        properties: properties.clone(),
        configuration,
        parent_instance_id,
        parent_app_id,
        declaration_key,
        created,
        resolved_dependencies,
    };

    if on_node(&node)? {
        Ok(Some(node))
    } else {
        Ok(None)
    }
}

/// A node visited by `walk_existing`, handed to `on_node` post-order.
pub struct ExistingWalkNode {
    pub instance: AppInstance,
    pub configuration: AppConfiguration,
    pub parent_instance_id: Option<InstanceId>,
    pub parent_app_id: Option<crate::types::AppId>,
    /// The key, on the parent's dependency list, of the edge that reached this node. `None` for
    /// the root.
    pub declaration_key: Option<String>,
}

pub fn walk_existing(
    store: &dyn AppStore,
    root: &AppInstance,
    target: ConfigurationTarget,
    language: &Language,
    warnings: &mut Vec<Warning>,
    include_instance: &mut dyn FnMut(Option<&AppInstance>, &AppInstance) -> bool,
    on_node: &mut dyn FnMut(&ExistingWalkNode) -> Result<bool, CoreError>,
) -> Result<Option<ExistingWalkNode>, CoreError> {
    let mut visited = IndexSet::new();
    walk_existing_node(
        store,
        None,
        None,
        root,
        target,
        language,
        warnings,
        &mut visited,
        include_instance,
        on_node,
    )
}

#[allow(clippy::too_many_arguments)]
fn walk_existing_node(
    store: &dyn AppStore,
    parent: Option<&AppInstance>,
    declaration_key: Option<String>,
    instance: &AppInstance,
    target: ConfigurationTarget,
    language: &Language,
    warnings: &mut Vec<Warning>,
    visited: &mut IndexSet<InstanceId>,
    include_instance: &mut dyn FnMut(Option<&AppInstance>, &AppInstance) -> bool,
    on_node: &mut dyn FnMut(&ExistingWalkNode) -> Result<bool, CoreError>,
) -> Result<Option<ExistingWalkNode>, CoreError> {
    if !visited.insert(instance.instance_id) {
        return Ok(None);
    }
    if !include_instance(parent, instance) {
        return Ok(None);
    }

    for dep in &instance.dependencies {
        match store.get_instance_by_id(dep.instance_id) {
            Ok(child) => {
                walk_existing_node(
                    store,
                    Some(instance),
                    Some(dep.key.clone()),
                    &child,
                    target,
                    language,
                    warnings,
                    visited,
                    include_instance,
                    on_node,
                )?;
            }
            Err(err) => {
                warnings.push(Warning::new(
                    Some(instance.instance_id),
                    format!("dangling dependency '{}': {err}", dep.key),
                ));
            }
        }
    }

    let configuration = match store.get_app_configuration(instance, target, language) {
        Ok(cfg) => cfg,
        Err(err) => {
            warnings.push(Warning::new(
                Some(instance.instance_id),
                format!("render failed: {err}"),
            ));
            return Ok(None);
        }
    };

    let node = ExistingWalkNode {
        instance: instance.clone(),
        configuration,
        parent_instance_id: parent.map(|p| p.instance_id),
        parent_app_id: parent.map(|p| p.app_id.clone()),
        declaration_key,
    };

    if on_node(&node)? {
        Ok(Some(node))
    } else {
        Ok(None)
    }
}
