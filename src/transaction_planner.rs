//! Orchestrates install/update/delete requests (§4.4): acquires a scratch `Transaction`, drives
//! `GraphWalker` with `DependencyResolver`/`PolicyEngine` decisions, reconciles component ids
//! through `IdReconciler`, feeds every visited node's configuration delta to the three
//! `Aggregator`s, and commits (or discards) the whole batch as one unit.
//!
//! Mirrors the teacher's "parameters struct + stateful traversal struct" split
//! (`query_planning_traversal.rs`) and the plan-then-execute facade shape of `Specman` in
//! `other_examples` (`plan_create`/`create`, `plan_delete`/`delete`): a planner owns its
//! collaborators, runs one request at a time, and never leaves partial state behind a failure.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::dependency_resolver::DependencyResolver;
use crate::error::{CoreError, JoinedError};
use crate::graph_walker::{self, DesiredWalkNode, EdgeResolution, ExistingWalkNode};
use crate::id_reconciler::IdReconciler;
use crate::policy;
use crate::store::{AppStore, ComponentRegistry, Translator, Validator, ValidatorStatus};
use crate::transaction::{TemporaryApps, Transaction};
use crate::types::{
    App, AppConfiguration, AppDependencyConfig, AppId, AppInstance, ConfigurationTarget,
    CreatePolicy, Dependency, DependencyDeclaration, InstanceId, Language, Properties,
    UpdateValues, Warning,
};

/// Key an old child is indexed under while building `oldDependencies` (§4.4.1 step 3): the
/// *parent's* app id (stable across instances of that app) together with the declaration key.
/// Coarser than the original's implicit per-instance addressing (DESIGN.md records this as a
/// deliberate simplification): two distinct live instances of the same parent app visited in the
/// same tree will share a slot if they declare the same key.
type DeclarationSlot = (AppId, String);

/// Bundles the four external collaborators plus the three aggregators behind one facade, the way
/// `Specman` bundles a `DefaultLifecycleController`, a `TemplateCatalog`, and a
/// `WorkspacePersistence` (§1 lists these as "out of scope" collaborators the core only consumes).
pub struct TransactionPlanner {
    store: Box<dyn AppStore>,
    validator: Box<dyn Validator>,
    registry: Box<dyn ComponentRegistry>,
    translator: Box<dyn Translator>,
    components: Box<dyn Aggregator>,
    scheduler: Box<dyn Aggregator>,
    static_ips: Box<dyn Aggregator>,
    language: Language,
    /// Mid-flight scratch, `Some` only while a request body is running. Exposed read-only through
    /// `temporary_apps` (§6, §14).
    scratch: Option<Transaction>,
}

impl TransactionPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Box<dyn AppStore>,
        validator: Box<dyn Validator>,
        registry: Box<dyn ComponentRegistry>,
        translator: Box<dyn Translator>,
        components: Box<dyn Aggregator>,
        scheduler: Box<dyn Aggregator>,
        static_ips: Box<dyn Aggregator>,
        language: impl Into<Language>,
    ) -> Self {
        Self {
            store,
            validator,
            registry,
            translator,
            components,
            scheduler,
            static_ips,
            language: language.into(),
            scratch: None,
        }
    }

    /// §6, §14: a snapshot of the active transaction, or `None` between requests.
    pub fn temporary_apps(&self) -> Option<TemporaryApps> {
        self.scratch.as_ref().map(Transaction::snapshot)
    }

    #[tracing::instrument(skip(self, instance, app), fields(app_id = %app.app_id, instance_id = %instance.instance_id))]
    pub fn install(
        &mut self,
        user: &str,
        instance: AppInstance,
        app: App,
    ) -> Result<UpdateValues, JoinedError> {
        self.scratch = Some(Transaction::new());
        let mut warnings = Vec::new();
        let body = self.update_internal(None, instance, app, &mut warnings);
        self.finish(user, body, warnings)
    }

    #[tracing::instrument(skip(self, old_instance, new_instance, app), fields(app_id = %app.app_id, instance_id = %old_instance.instance_id))]
    pub fn update(
        &mut self,
        user: &str,
        old_instance: AppInstance,
        new_instance: AppInstance,
        app: App,
    ) -> Result<UpdateValues, JoinedError> {
        self.scratch = Some(Transaction::new());
        let mut warnings = Vec::new();
        let body = self.update_internal(Some(old_instance), new_instance, app, &mut warnings);
        self.finish(user, body, warnings)
    }

    #[tracing::instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    pub fn delete(&mut self, user: &str, instance: AppInstance) -> Result<UpdateValues, JoinedError> {
        self.scratch = Some(Transaction::new());
        let mut warnings = Vec::new();
        let body = self.delete_internal(instance, &mut warnings);
        self.finish(user, body, warnings)
    }

    /// Shared tail of all three entry points: attempt to commit only if the body succeeded, then
    /// always reset the aggregators and discard the scratch — success or failure (§4.4, §5
    /// "aggregator reset must be called before any retry").
    fn finish(
        &mut self,
        user: &str,
        body: Result<UpdateValues, CoreError>,
        warnings: Vec<Warning>,
    ) -> Result<UpdateValues, JoinedError> {
        let result = match body {
            Ok(mut values) => {
                values.warnings.extend(warnings);
                match self.commit_aggregators(user, &values) {
                    Ok(()) => Ok(values),
                    Err(errors) => Err(JoinedError::new(errors)),
                }
            }
            Err(err) => Err(JoinedError::from(err)),
        };
        self.reset_aggregators();
        self.scratch = None;
        result
    }

    fn reset_aggregators(&mut self) {
        self.components.reset();
        self.scheduler.reset();
        self.static_ips.reset();
    }

    /// §4.6: fixed commit order components → scheduler → static-ips, lenient aggregation per §9's
    /// open question — every aggregator is attempted even if an earlier one failed, and all
    /// failures are returned together rather than stopping at the first.
    fn commit_aggregators(&mut self, user: &str, values: &UpdateValues) -> Result<(), Vec<CoreError>> {
        let other_app_configs = values.created_or_modified.clone();
        let mut errors = Vec::new();
        for aggregator in [&mut self.components, &mut self.scheduler, &mut self.static_ips] {
            if let Err(err) = aggregator.commit(user, &other_app_configs) {
                tracing::warn!(aggregator = aggregator.name(), error = %err, "aggregator commit failed");
                errors.push(CoreError::AggregatorFailed {
                    aggregator: aggregator.name(),
                    message: err.to_string(),
                    source: Some(err.into()),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn scratch_mut(&mut self) -> &mut Transaction {
        self.scratch.as_mut().expect("scratch acquired at request entry")
    }

    fn scratch_ref(&self) -> &Transaction {
        self.scratch.as_ref().expect("scratch acquired at request entry")
    }

    // ---- install / update (§4.4.1) ----------------------------------------------------------

    fn update_internal(
        &mut self,
        old_instance: Option<AppInstance>,
        new_instance: AppInstance,
        app: App,
        warnings: &mut Vec<Warning>,
    ) -> Result<UpdateValues, CoreError> {
        if old_instance.is_none() {
            let status = self.validator.status(&app);
            if status != ValidatorStatus::Installable {
                let message = self
                    .validator
                    .message(&app, status)
                    .unwrap_or_else(|| format!("app {} failed validation ({status})", app.app_id));
                tracing::warn!(app_id = %app.app_id, %message, "install rejected by validator");
                return Err(match status {
                    ValidatorStatus::Incompatible => CoreError::NotCompatible {
                        app_id: app.app_id.clone(),
                    },
                    _ => CoreError::NotInstallable {
                        app_id: app.app_id.clone(),
                    },
                });
            }
        }

        let mut new_instance = new_instance;
        if let Some(old) = &old_instance {
            self.restrict_update_against_parents(old, &mut new_instance, warnings)?;
        }

        let old_dependencies = match &old_instance {
            Some(old) => self.index_old_dependencies(old, warnings)?,
            None => HashMap::new(),
        };

        let target = ConfigurationTarget::Update;
        let language = self.language.clone();
        let consumed: RefCell<HashSet<DeclarationSlot>> = RefCell::new(HashSet::new());
        let mut promised: HashSet<InstanceId> = HashSet::new();
        let mut claimed_ids: HashSet<String> = HashSet::new();
        let mut root_instance: Option<AppInstance> = None;
        // §4.4.1 step 4b bookkeeping: every instance visited this walk (excluded as adoption
        // targets below — they're already wired up within this tree) and every child resolved
        // *without* a matching old dependency (create or fresh reuse), eligible to also satisfy an
        // unrelated existing parent's still-unfilled declaration.
        let mut walked_instance_ids: HashSet<InstanceId> = HashSet::new();
        let mut fresh_children: Vec<(InstanceId, AppId)> = Vec::new();

        {
            // Disjoint field borrows: `store`/`registry` stay immutable while `components`,
            // `scheduler`, `static_ips`, and `scratch` are borrowed mutably alongside them, so the
            // closures below can call into all of them without going through `&mut self`.
            let store: &dyn AppStore = self.store.as_ref();
            let registry: &dyn ComponentRegistry = self.registry.as_ref();
            let components: &mut dyn Aggregator = self.components.as_mut();
            let scheduler: &mut dyn Aggregator = self.scheduler.as_mut();
            let static_ips: &mut dyn Aggregator = self.static_ips.as_mut();
            let scratch = self.scratch.as_mut().expect("scratch acquired at request entry");
            let resolver = DependencyResolver::new(store);

            let mut choose_alternative =
                |alternatives: &[AppDependencyConfig]| resolver.choose_alternative(alternatives);

            let mut include_edge =
                |parent_app: &App, decl: &DependencyDeclaration, alternative: &AppDependencyConfig| {
                    resolve_for_update(
                        store,
                        &resolver,
                        parent_app,
                        decl,
                        alternative,
                        &old_dependencies,
                        &consumed,
                        &mut promised,
                    )
                };

            let mut on_node = |node: &DesiredWalkNode| -> Result<bool, CoreError> {
                walked_instance_ids.insert(node.instance_id);
                if let (Some(parent_app_id), Some(decl_key)) =
                    (&node.parent_app_id, &node.declaration_key)
                {
                    let slot = (parent_app_id.clone(), decl_key.clone());
                    if !consumed.borrow().contains(&slot) {
                        fresh_children.push((node.instance_id, node.app_id.clone()));
                    }
                }

                let materialized = materialize_node(
                    store,
                    registry,
                    components,
                    scheduler,
                    static_ips,
                    node,
                    target,
                    &language,
                    &mut claimed_ids,
                )?;
                match materialized {
                    Some(instance) => {
                        tracing::debug!(
                            instance_id = %instance.instance_id,
                            app_id = %instance.app_id,
                            "visited node"
                        );
                        if node.parent_instance_id.is_none() {
                            root_instance = Some(instance.clone());
                        }
                        // A node is only a genuine creation if no live instance with this id
                        // already exists — `node.created` also covers carry-forward children
                        // (and the root of an update) resolved via `IncludeWithDependencies`,
                        // which must land in `modifying` instead (§4.4.1 step 4d).
                        if store.get_instance_by_id(node.instance_id).is_ok() {
                            scratch.mark_modifying(instance);
                        } else {
                            scratch.mark_creating(instance);
                        }
                    }
                    None => {
                        if node.parent_instance_id.is_none() {
                            root_instance = Some(AppInstance {
                                instance_id: node.instance_id,
                                app_id: node.app_id.clone(),
                                alias: node.alias.clone(),
                                properties: node.properties.clone(),
                                dependencies: node.resolved_dependencies.clone(),
                            });
                        }
                    }
                }
                Ok(true)
            };

            graph_walker::walk_desired(
                store,
                &app,
                new_instance.instance_id,
                new_instance.alias.as_deref(),
                &new_instance.properties,
                target,
                &language,
                warnings,
                &mut choose_alternative,
                &mut include_edge,
                &mut on_node,
            )?;
        }

        // §4.4.1 step 5: any old declaration slot not matched during the walk is a removal.
        let consumed = consumed.into_inner();
        for (slot, old_child) in old_dependencies {
            if consumed.contains(&slot) {
                continue;
            }
            self.remove_unmatched_old_child(&old_child, target, &language, warnings)?;
        }

        // §4.4.1 step 4b: a freshly resolved child may also satisfy an unrelated existing
        // parent's still-unfilled declaration for the same app.
        self.adopt_into_other_parents(&fresh_children, &walked_instance_ids)?;

        self.drop_dead_edges();

        Ok(UpdateValues {
            root: root_instance,
            created_or_modified: self.scratch_ref().created_or_modified(),
            deleted: self.scratch_ref().deleted(),
            warnings: Vec::new(),
        })
    }

    /// §4.4.1 step 2: when the *root* of this update already has live parents, each parent's
    /// `DependencyUpdatePolicy` may restrict what the caller is allowed to change.
    fn restrict_update_against_parents(
        &self,
        old: &AppInstance,
        new_instance: &mut AppInstance,
        warnings: &mut Vec<Warning>,
    ) -> Result<(), CoreError> {
        for parent in self.store.get_apps_with_dependency_to(old.instance_id) {
            let Some(dep) = parent.dependency_matching(old.instance_id) else {
                continue;
            };
            let parent_app = self.store.get_app_by_id(&parent.app_id)?;
            let Some(decl) = parent_app.declaration(&dep.key) else {
                continue;
            };
            let Some(alternative) = decl.alternatives.iter().find(|alt| {
                alt.app_id.as_deref() == Some(old.app_id.as_str())
                    || alt.specific_instance_id == Some(old.instance_id)
            }) else {
                continue;
            };

            match decl.dependency_update_policy {
                crate::types::DependencyUpdatePolicy::AllowAll => {}
                crate::types::DependencyUpdatePolicy::AllowNone => {
                    if new_instance.properties != old.properties {
                        return Err(CoreError::policy_denied(format!(
                            "declaration '{}' on {} forbids updating {}'s properties",
                            dep.key, parent.app_id, old.app_id
                        )));
                    }
                    if new_instance.alias != old.alias {
                        return Err(CoreError::policy_denied(format!(
                            "declaration '{}' on {} forbids updating {}'s alias",
                            dep.key, parent.app_id, old.app_id
                        )));
                    }
                }
                crate::types::DependencyUpdatePolicy::AllowOnlyUnconfiguredProperties => {
                    for (key, value) in &alternative.properties {
                        if new_instance.properties.get(key) != Some(value) {
                            new_instance.properties.insert(key.clone(), value.clone());
                            warnings.push(Warning::new(
                                Some(old.instance_id),
                                self.translator.translate(
                                    &self.language,
                                    "warning.property_restored_by_parent",
                                    &[key, &parent.app_id],
                                ),
                            ));
                        }
                    }
                    if alternative.alias.is_some() && new_instance.alias != old.alias {
                        new_instance.alias = old.alias.clone();
                        warnings.push(Warning::new(
                            Some(old.instance_id),
                            self.translator.translate(
                                &self.language,
                                "warning.alias_restored_by_parent",
                                &[&parent.app_id],
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// §4.4.1 step 3: walk the old installed tree and index each child by the declaration slot it
    /// occupied on its parent, so the desired-tree walk can tell "same slot, same app" (carry
    /// forward) from "same slot, different app" (replacement) from "brand new slot".
    fn index_old_dependencies(
        &self,
        old_instance: &AppInstance,
        warnings: &mut Vec<Warning>,
    ) -> Result<HashMap<DeclarationSlot, AppInstance>, CoreError> {
        let store: &dyn AppStore = self.store.as_ref();
        let mut index = HashMap::new();
        let mut include_instance = |_parent: Option<&AppInstance>, _child: &AppInstance| true;
        let mut on_node = |node: &ExistingWalkNode| -> Result<bool, CoreError> {
            if let (Some(parent_app_id), Some(key)) = (&node.parent_app_id, &node.declaration_key) {
                index.insert((parent_app_id.clone(), key.clone()), node.instance.clone());
            }
            Ok(true)
        };
        graph_walker::walk_existing(
            store,
            old_instance,
            ConfigurationTarget::Update,
            &self.language,
            warnings,
            &mut include_instance,
            &mut on_node,
        )?;
        Ok(index)
    }

    /// §4.4.1 step 5: an old child no longer matched by the desired tree is removed if nothing
    /// else still depends on it.
    fn remove_unmatched_old_child(
        &mut self,
        old_child: &AppInstance,
        target: ConfigurationTarget,
        language: &Language,
        warnings: &mut Vec<Warning>,
    ) -> Result<(), CoreError> {
        if self.scratch_ref().contains(old_child.instance_id) {
            return Ok(());
        }
        let scratch = self.scratch_ref();
        let still_referenced = self
            .store
            .get_apps_with_dependency_to(old_child.instance_id)
            .iter()
            .any(|parent| !scratch.is_deleting(parent.instance_id));

        if !still_referenced {
            let old_config = self
                .store
                .get_app_configuration(old_child, target, language)
                .ok();
            self.components.aggregate(None, old_config.as_ref());
            self.scheduler.aggregate(None, old_config.as_ref());
            self.static_ips.aggregate(None, old_config.as_ref());
            self.scratch_mut().mark_deleting(old_child.clone());
        } else {
            warnings.push(Warning::new(
                Some(old_child.instance_id),
                self.translator.translate(
                    &self.language,
                    "warning.still_referenced_not_removed",
                    &[&old_child.app_id],
                ),
            ));
        }
        Ok(())
    }

    // ---- delete (§4.4.2) ---------------------------------------------------------------------

    fn delete_internal(
        &mut self,
        instance: AppInstance,
        warnings: &mut Vec<Warning>,
    ) -> Result<UpdateValues, CoreError> {
        let root_id = instance.instance_id;
        let target = ConfigurationTarget::Delete;
        let language = self.language.clone();

        // Collect (parent, child, declaration) triples for nodes the gate skips but whose
        // declaration demands a demotion to read-only, so the demotion can run *after* the walk
        // (walk_existing only needs `&self.store`; the demotion itself needs `&mut self`).
        let mut demotions: Vec<(AppInstance, AppInstance, DependencyDeclaration)> = Vec::new();
        let mut deleted_nodes: Vec<(AppInstance, AppConfiguration)> = Vec::new();

        {
            let store: &dyn AppStore = self.store.as_ref();
            let mut include_instance = |parent: Option<&AppInstance>, child: &AppInstance| {
                let Some(parent) = parent else { return true };
                let Some(dep) = parent.dependency_matching(child.instance_id) else {
                    return true;
                };
                let Ok(parent_app) = store.get_app_by_id(&parent.app_id) else {
                    return true;
                };
                let Some(decl) = parent_app.declaration(&dep.key) else {
                    return true;
                };
                let referrers: Vec<InstanceId> = store
                    .get_apps_with_dependency_to(child.instance_id)
                    .iter()
                    .map(|p| p.instance_id)
                    .collect();
                let include = policy::allowed_to_delete(decl, parent.instance_id, &referrers);
                if !include && decl.update_policy == crate::types::UpdatePolicy::Always {
                    demotions.push((parent.clone(), child.clone(), decl.clone()));
                }
                include
            };
            let mut on_node = |node: &ExistingWalkNode| -> Result<bool, CoreError> {
                deleted_nodes.push((node.instance.clone(), node.configuration.clone()));
                Ok(true)
            };
            graph_walker::walk_existing(
                store,
                &instance,
                target,
                &language,
                warnings,
                &mut include_instance,
                &mut on_node,
            )?;
        }

        for (instance, config) in &deleted_nodes {
            self.components.aggregate(None, Some(config));
            self.scheduler.aggregate(None, Some(config));
            self.static_ips.aggregate(None, Some(config));
            self.scratch_mut().mark_deleting(instance.clone());
        }

        for (parent, child, decl) in demotions {
            if self.scratch_ref().is_deleting(child.instance_id) {
                continue;
            }
            let alternative = decl
                .alternatives
                .iter()
                .find(|alt| alt.app_id.as_deref() == Some(child.app_id.as_str()))
                .cloned();
            let mut demoted = child.clone();
            if let Some(alt) = alternative {
                for (key, value) in &alt.properties {
                    demoted.properties.insert(key.clone(), value.clone());
                }
            }
            let child_app = self.store.get_app_by_id(&child.app_id)?;
            tracing::debug!(
                parent = %parent.app_id,
                child = %child.app_id,
                "demoting dependency to read-only before parent delete"
            );
            self.update_internal(Some(child.clone()), demoted, child_app, warnings)?;
        }

        self.drop_dead_edges();

        // §4.4.2 step 4: every live instance still pointing at the root must be allowed to.
        for parent in self.store.get_apps_with_dependency_to(root_id) {
            if self.scratch_ref().is_deleting(parent.instance_id) {
                continue;
            }
            let Some(dep) = parent.dependency_matching(root_id) else {
                continue;
            };
            let parent_app = self.store.get_app_by_id(&parent.app_id)?;
            if let Some(decl) = parent_app.declaration(&dep.key) {
                if !policy::parent_may_delete_child(decl) {
                    return Err(CoreError::policy_denied(format!(
                        "{} still depends on the deleted instance via '{}'",
                        parent.app_id, dep.key
                    )));
                }
            }
        }

        let root = deleted_nodes
            .iter()
            .find(|(instance, _)| instance.instance_id == root_id)
            .map(|(instance, _)| instance.clone());

        Ok(UpdateValues {
            root,
            created_or_modified: self.scratch_ref().created_or_modified(),
            deleted: self.scratch_ref().deleted(),
            warnings: Vec::new(),
        })
    }

    /// §4.4.1 step 4b: for each child resolved without a matching old dependency (fresh creation
    /// or fresh reuse), look for *other* live instances — outside this walk — that declare a
    /// still-unfilled dependency compatible with the child's app, and wire up at most one of them
    /// by adding a new `Dependency` edge (which puts that parent into `modifying`). Candidates are
    /// ranked deterministically per DESIGN.md's resolution of the §9 open question: a lonely
    /// candidate parent (no live referrer of its own) wins; otherwise the first candidate whose
    /// matching declaration is `CreatePolicy::Always`, both tie-broken by `(declaration key,
    /// instance id)`.
    fn adopt_into_other_parents(
        &mut self,
        fresh_children: &[(InstanceId, AppId)],
        walked_instance_ids: &HashSet<InstanceId>,
    ) -> Result<(), CoreError> {
        if fresh_children.is_empty() {
            return Ok(());
        }
        let live = self.store.live_instances();
        for (child_id, child_app_id) in fresh_children {
            if self.scratch_ref().is_deleting(*child_id) {
                continue;
            }
            let mut candidates: Vec<(AppInstance, DependencyDeclaration)> = Vec::new();
            for parent in &live {
                if walked_instance_ids.contains(&parent.instance_id) {
                    continue;
                }
                let Ok(parent_app) = self.store.get_app_by_id(&parent.app_id) else {
                    continue;
                };
                for decl in &parent_app.dependencies {
                    if decl.declares_app(child_app_id) && parent.dependency(&decl.key).is_none() {
                        candidates.push((parent.clone(), decl.clone()));
                        break;
                    }
                }
            }
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by(|(a_parent, a_decl), (b_parent, b_decl)| {
                (&a_decl.key, a_parent.instance_id).cmp(&(&b_decl.key, b_parent.instance_id))
            });

            let resolver = DependencyResolver::new(self.store.as_ref());
            let chosen = candidates
                .iter()
                .find(|(parent, _)| resolver.is_lonely(parent.instance_id))
                .or_else(|| {
                    candidates
                        .iter()
                        .find(|(_, decl)| decl.create_policy == CreatePolicy::Always)
                })
                .cloned();

            if let Some((mut parent, decl)) = chosen {
                tracing::debug!(
                    parent = %parent.app_id,
                    child_app = %child_app_id,
                    key = %decl.key,
                    "adopting fresh child into an unrelated parent's unfilled slot"
                );
                parent.dependencies.push(Dependency::new(decl.key.clone(), *child_id));
                self.scratch_mut().mark_modifying(parent);
            }
        }
        Ok(())
    }

    /// §4.4.1 step 6 / §4.4.2 step 3: any live instance outside the transaction whose
    /// `dependencies` point at something now in `deleting` loses those edges and is recorded as
    /// `modifying`.
    fn drop_dead_edges(&mut self) {
        let deleting: HashSet<InstanceId> =
            self.scratch_ref().deleting().map(|i| i.instance_id).collect();
        if deleting.is_empty() {
            return;
        }
        let live = self.store.live_instances();
        for instance in live {
            if self.scratch_ref().contains(instance.instance_id) {
                continue;
            }
            if instance.dependencies.iter().any(|d| deleting.contains(&d.instance_id)) {
                let mut pruned = instance.clone();
                pruned.dependencies.retain(|d| !deleting.contains(&d.instance_id));
                self.scratch_mut().mark_modifying(pruned);
            }
        }
    }
}

/// §4.5 / §4.4.1 step 4c: render, reconcile component ids, strip non-persistable properties, and
/// diff against the old instance (if any) to decide whether this node actually changed.
/// Returns `None` when nothing changed (idempotence, §8 invariant 5) — the node is not aggregated
/// and not recorded in `creating`/`modifying`.
#[allow(clippy::too_many_arguments)]
fn materialize_node(
    store: &dyn AppStore,
    registry: &dyn ComponentRegistry,
    components: &mut dyn Aggregator,
    scheduler: &mut dyn Aggregator,
    static_ips: &mut dyn Aggregator,
    node: &DesiredWalkNode,
    target: ConfigurationTarget,
    language: &Language,
    claimed_ids: &mut HashSet<String>,
) -> Result<Option<AppInstance>, CoreError> {
    let old_instance = store.get_instance_by_id(node.instance_id).ok();
    let app = store.get_app_by_id(&node.app_id)?;

    let reconciler = IdReconciler::new(registry);
    let reconciled = reconciler.reconcile(
        &app,
        target,
        node.alias.as_deref(),
        &node.properties,
        old_instance.as_ref().map(|i| &i.properties),
        claimed_ids,
        language,
    )?;

    let mut properties = reconciled.properties;
    for key in properties.keys().cloned().collect::<Vec<_>>() {
        if !app.is_persistable(&key) {
            properties.shift_remove(&key);
        }
    }

    let new_instance = AppInstance {
        instance_id: node.instance_id,
        app_id: node.app_id.clone(),
        alias: node.alias.clone(),
        properties,
        dependencies: node.resolved_dependencies.clone(),
    };

    let new_config = AppConfiguration {
        components: reconciled.components,
        ..node.configuration.clone()
    };

    let old_config = match &old_instance {
        Some(old) => store.get_app_configuration(old, target, language).ok(),
        None => None,
    };

    let unchanged = old_instance.as_ref().is_some_and(|old| {
        old.alias == new_instance.alias
            && old.properties == new_instance.properties
            && old.dependencies == new_instance.dependencies
            && Some(&new_config) == old_config.as_ref()
    });
    if unchanged {
        return Ok(None);
    }

    components.aggregate(Some(&new_config), old_config.as_ref());
    scheduler.aggregate(Some(&new_config), old_config.as_ref());
    static_ips.aggregate(Some(&new_config), old_config.as_ref());

    Ok(Some(new_instance))
}

/// §4.3, update-aware: reuse the matching old child when the slot is still satisfied by the same
/// app; otherwise fall back to `DependencyResolver`'s normal reuse-or-create search, leaving the
/// old child unconsumed (and therefore subject to removal in step 5).
///
/// `app` here is the *parent* whose declarations are being walked (see the `(AppId, key)` slot
/// lookup below) — the carry-forward branch must render the *child's* own app, fetched fresh from
/// `store` by `old_child.app_id`, not the parent's.
fn resolve_for_update(
    store: &dyn AppStore,
    resolver: &DependencyResolver<'_>,
    app: &App,
    decl: &DependencyDeclaration,
    alternative: &AppDependencyConfig,
    old_dependencies: &HashMap<DeclarationSlot, AppInstance>,
    consumed: &RefCell<HashSet<DeclarationSlot>>,
    promised: &mut HashSet<InstanceId>,
) -> EdgeResolution {
    let slot = (app.app_id.clone(), decl.key.clone());
    if let Some(old_child) = old_dependencies.get(&slot) {
        let same_alternative = alternative.specific_instance_id == Some(old_child.instance_id)
            || alternative.app_id.as_deref() == Some(old_child.app_id.as_str());
        if same_alternative {
            let Ok(child_app) = store.get_app_by_id(&old_child.app_id) else {
                // Catalog entry for the old child vanished; recovered locally per §7
                // (AppNotFound is skipped rather than aborting the walk) — fall through to the
                // normal resolver search, leaving this slot unconsumed so it's removed in step 5.
                return match resolver.include_edge(alternative, decl, promised, Uuid::new_v4()) {
                    Ok(resolution) => resolution,
                    Err(_) => EdgeResolution::NotIncluded,
                };
            };

            consumed.borrow_mut().insert(slot);
            promised.insert(old_child.instance_id);

            let mut properties = alternative.properties.clone();
            for (key, value) in &old_child.properties {
                let carried_forward = !properties.contains_key(key);
                let child_wins = policy::child_may_override(decl, key, &alternative.properties);
                if carried_forward || child_wins {
                    properties.insert(key.clone(), value.clone());
                }
            }

            tracing::debug!(
                instance_id = %old_child.instance_id,
                key = %decl.key,
                "carrying forward matching old dependency"
            );
            return EdgeResolution::IncludeWithDependencies {
                instance_id: old_child.instance_id,
                app: Box::new(child_app),
                alias: alternative.alias.clone().or_else(|| old_child.alias.clone()),
                properties,
            };
        }
    }

    match resolver.include_edge(alternative, decl, promised, Uuid::new_v4()) {
        Ok(resolution) => resolution,
        Err(_) => EdgeResolution::NotIncluded,
    }
}

impl AppInstance {
    /// The dependency edge (if any) on this instance pointing at `target`.
    fn dependency_matching(&self, target: InstanceId) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.instance_id == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        AlwaysInstallable, EchoTranslator, FixtureComponentRegistry, FixtureStore,
        RecordingAggregator,
    };
    use crate::types::{
        ComponentDefinition, CreatePolicy, DependencyDeletePolicy, DependencyUpdatePolicy,
        DeletePolicy, UpdatePolicy, ValidatorConfig,
    };
    use indexmap::IndexSet;

    fn meter_app() -> App {
        App::new(
            "Meter",
            Vec::new(),
            IndexSet::new(),
            ValidatorConfig::default(),
            |_target, _alias, _properties, _language| {
                Ok(AppConfiguration {
                    components: vec![ComponentDefinition {
                        id: "meter0".into(),
                        factory_id: "meter-factory".into(),
                        alias: None,
                        properties: Properties::new(),
                    }],
                    scheduler_order: vec!["meter0".into()],
                    network_interfaces: Vec::new(),
                    dependencies: Vec::new(),
                })
            },
        )
    }

    fn battery_monitor_app(create_policy: CreatePolicy) -> App {
        App::new(
            "BatteryMonitor",
            vec![DependencyDeclaration {
                key: "meter".into(),
                alternatives: vec![AppDependencyConfig::by_app("Meter")],
                create_policy,
                update_policy: UpdatePolicy::Always,
                delete_policy: DeletePolicy::IfMine,
                dependency_update_policy: DependencyUpdatePolicy::AllowAll,
                dependency_delete_policy: DependencyDeletePolicy::Allowed,
            }],
            IndexSet::new(),
            ValidatorConfig::default(),
            |_target, _alias, _properties, _language| {
                Ok(AppConfiguration {
                    components: vec![ComponentDefinition {
                        id: "bm0".into(),
                        factory_id: "bm-factory".into(),
                        alias: None,
                        properties: Properties::new(),
                    }],
                    scheduler_order: vec!["bm0".into()],
                    network_interfaces: Vec::new(),
                    dependencies: Vec::new(),
                })
            },
        )
    }

    fn planner(store: FixtureStore) -> TransactionPlanner {
        TransactionPlanner::new(
            Box::new(store),
            Box::new(AlwaysInstallable),
            Box::new(FixtureComponentRegistry::default()),
            Box::new(EchoTranslator),
            Box::new(RecordingAggregator::new("components")),
            Box::new(RecordingAggregator::new("scheduler")),
            Box::new(RecordingAggregator::new("static_ips")),
            "en",
        )
    }

    #[test]
    fn s1_install_creates_fresh_dependency() {
        let mut store = FixtureStore::new();
        store.add_app(meter_app());
        store.add_app(battery_monitor_app(CreatePolicy::IfNotExisting));
        let mut planner = planner(store);

        let bm = AppInstance::new(Uuid::new_v4(), "BatteryMonitor");
        let app = planner.store.get_app_by_id("BatteryMonitor").unwrap();
        let values = planner.install("alice", bm, app).unwrap();

        assert_eq!(values.created_or_modified.len(), 2);
        assert!(values.deleted.is_empty());
        let root = values.root.expect("root present");
        assert_eq!(root.dependencies.len(), 1);
        assert_eq!(root.dependencies[0].key, "meter");
    }

    #[test]
    fn s2_install_reuses_existing_lonely_instance() {
        let mut store = FixtureStore::new();
        store.add_app(meter_app());
        store.add_app(battery_monitor_app(CreatePolicy::IfNotExisting));
        let meter_id = Uuid::new_v4();
        store.add_instance(AppInstance::new(meter_id, "Meter"));
        let mut planner = planner(store);

        let bm = AppInstance::new(Uuid::new_v4(), "BatteryMonitor");
        let app = planner.store.get_app_by_id("BatteryMonitor").unwrap();
        let values = planner.install("alice", bm, app).unwrap();

        assert_eq!(values.created_or_modified.len(), 1);
        let root = values.root.expect("root present");
        assert_eq!(root.dependencies[0].instance_id, meter_id);
    }

    #[test]
    fn s4_cascade_delete_if_mine_removes_lonely_child() {
        let mut store = FixtureStore::new();
        store.add_app(meter_app());
        store.add_app(battery_monitor_app(CreatePolicy::Always));
        let meter_id = Uuid::new_v4();
        let bm_id = Uuid::new_v4();
        store.add_instance(AppInstance::new(meter_id, "Meter"));
        store.add_instance(
            AppInstance::new(bm_id, "BatteryMonitor")
                .with_dependencies(vec![Dependency::new("meter", meter_id)]),
        );
        let mut planner = planner(store);

        let bm = planner.store.get_instance_by_id(bm_id).unwrap();
        let values = planner.delete("alice", bm).unwrap();

        let deleted_ids: HashSet<InstanceId> =
            values.deleted.iter().map(|i| i.instance_id).collect();
        assert!(deleted_ids.contains(&bm_id));
        assert!(deleted_ids.contains(&meter_id));
    }

    #[test]
    fn s4_cascade_delete_if_mine_keeps_shared_child() {
        let mut store = FixtureStore::new();
        store.add_app(meter_app());
        store.add_app(battery_monitor_app(CreatePolicy::Always));
        let meter_id = Uuid::new_v4();
        let bm_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        store.add_instance(AppInstance::new(meter_id, "Meter"));
        store.add_instance(
            AppInstance::new(bm_id, "BatteryMonitor")
                .with_dependencies(vec![Dependency::new("meter", meter_id)]),
        );
        store.add_instance(
            AppInstance::new(other_id, "BatteryMonitor")
                .with_dependencies(vec![Dependency::new("meter", meter_id)]),
        );
        let mut planner = planner(store);

        let bm = planner.store.get_instance_by_id(bm_id).unwrap();
        let values = planner.delete("alice", bm).unwrap();

        let deleted_ids: HashSet<InstanceId> =
            values.deleted.iter().map(|i| i.instance_id).collect();
        assert!(deleted_ids.contains(&bm_id));
        assert!(!deleted_ids.contains(&meter_id));
    }

    #[test]
    fn temporary_apps_is_none_outside_a_request() {
        let store = FixtureStore::new();
        let planner = planner(store);
        assert!(planner.temporary_apps().is_none());
    }

    fn inverter_app(create_policy: CreatePolicy) -> App {
        App::new(
            "Inverter",
            vec![DependencyDeclaration {
                key: "meter".into(),
                alternatives: vec![AppDependencyConfig::by_app("Meter")],
                create_policy,
                update_policy: UpdatePolicy::Always,
                delete_policy: DeletePolicy::IfMine,
                dependency_update_policy: DependencyUpdatePolicy::AllowAll,
                dependency_delete_policy: DependencyDeletePolicy::Allowed,
            }],
            IndexSet::new(),
            ValidatorConfig::default(),
            |_target, _alias, _properties, _language| {
                Ok(AppConfiguration {
                    components: vec![ComponentDefinition {
                        id: "inv0".into(),
                        factory_id: "inverter-factory".into(),
                        alias: None,
                        properties: Properties::new(),
                    }],
                    scheduler_order: vec!["inv0".into()],
                    network_interfaces: Vec::new(),
                    dependencies: Vec::new(),
                })
            },
        )
    }

    #[test]
    fn s4b_fresh_child_is_adopted_by_an_unrelated_parents_unfilled_slot() {
        let mut store = FixtureStore::new();
        store.add_app(meter_app());
        store.add_app(battery_monitor_app(CreatePolicy::IfNotExisting));
        store.add_app(inverter_app(CreatePolicy::Never));
        let inverter_id = Uuid::new_v4();
        store.add_instance(AppInstance::new(inverter_id, "Inverter"));
        let mut planner = planner(store);

        let bm = AppInstance::new(Uuid::new_v4(), "BatteryMonitor");
        let app = planner.store.get_app_by_id("BatteryMonitor").unwrap();
        let values = planner.install("alice", bm, app).unwrap();

        let meter_id = values
            .root
            .as_ref()
            .unwrap()
            .dependencies
            .iter()
            .find(|d| d.key == "meter")
            .unwrap()
            .instance_id;

        let adopted_inverter = values
            .created_or_modified
            .iter()
            .find(|i| i.instance_id == inverter_id)
            .expect("inverter is recorded as modified once it adopts the fresh meter");
        assert_eq!(
            adopted_inverter.dependency("meter").map(|d| d.instance_id),
            Some(meter_id)
        );
    }
}
