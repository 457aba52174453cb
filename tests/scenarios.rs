//! Black-box scenario tests against the public API (§8's S1-S6 plus the round-trip property),
//! built against an in-memory `FixtureStore` rather than the JSON fixture format the `cli` demo
//! uses.

use edge_app_planner::fixtures::{
    AlwaysInstallable, EchoTranslator, FixtureComponentRegistry, FixtureStore, RecordingAggregator,
};
use edge_app_planner::{
    App, AppConfiguration, AppDependencyConfig, AppInstance, ComponentDefinition,
    ComponentRegistry, CoreError, CreatePolicy, Dependency, DependencyDeclaration,
    DependencyDeletePolicy, DependencyUpdatePolicy, DeletePolicy, Properties, TransactionPlanner,
    UpdatePolicy, ValidatorConfig,
};
use indexmap::IndexSet;
use std::collections::HashSet;
use uuid::Uuid;

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

fn battery_monitor_app(
    create_policy: CreatePolicy,
    dependency_update_policy: DependencyUpdatePolicy,
) -> App {
    App::new(
        "BatteryMonitor",
        vec![DependencyDeclaration {
            key: "meter".into(),
            alternatives: vec![AppDependencyConfig::by_app("Meter")],
            create_policy,
            update_policy: UpdatePolicy::Always,
            delete_policy: DeletePolicy::IfMine,
            dependency_update_policy,
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
fn s1_install_with_fresh_dependency() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(
        CreatePolicy::IfNotExisting,
        DependencyUpdatePolicy::AllowAll,
    ));
    let mut planner = planner(store);

    let bm_id = Uuid::new_v4();
    let bm = AppInstance::new(bm_id, "BatteryMonitor");
    let values = planner
        .install(
            "alice",
            bm,
            battery_monitor_app(CreatePolicy::IfNotExisting, DependencyUpdatePolicy::AllowAll),
        )
        .expect("install succeeds");

    assert_eq!(values.created_or_modified.len(), 2);
    assert!(values.deleted.is_empty());
    let root = values.root.expect("root present");
    assert_eq!(root.instance_id, bm_id);
    assert_eq!(root.dependencies.len(), 1);
    assert_eq!(root.dependencies[0].key, "meter");
}

#[test]
fn s2_install_reusing_existing_lonely_instance() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(
        CreatePolicy::IfNotExisting,
        DependencyUpdatePolicy::AllowAll,
    ));
    let meter_id = Uuid::new_v4();
    store.add_instance(AppInstance::new(meter_id, "Meter"));
    let mut planner = planner(store);

    let bm = AppInstance::new(Uuid::new_v4(), "BatteryMonitor");
    let values = planner
        .install(
            "alice",
            bm,
            battery_monitor_app(CreatePolicy::IfNotExisting, DependencyUpdatePolicy::AllowAll),
        )
        .expect("install succeeds");

    assert_eq!(values.created_or_modified.len(), 1);
    assert!(values.deleted.is_empty());
    let root = values.root.expect("root present");
    assert_eq!(root.dependencies[0].instance_id, meter_id);
}

#[test]
fn s3_update_under_allow_none_is_denied() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(
        CreatePolicy::IfNotExisting,
        DependencyUpdatePolicy::AllowNone,
    ));
    let meter_id = Uuid::new_v4();
    let bm_id = Uuid::new_v4();
    store.add_instance(AppInstance::new(meter_id, "Meter"));
    store.add_instance(
        AppInstance::new(bm_id, "BatteryMonitor")
            .with_dependencies(vec![Dependency::new("meter", meter_id)]),
    );
    let mut planner = planner(store);

    let old_meter = AppInstance::new(meter_id, "Meter");
    let mut new_properties = Properties::new();
    new_properties.insert("voltage".to_string(), serde_json::json!(240));
    let new_meter = old_meter.clone().with_properties(new_properties);

    let err = planner
        .update("alice", old_meter, new_meter, meter_app())
        .expect_err("ALLOW_NONE must deny a direct property update");
    assert!(err
        .causes()
        .iter()
        .any(|c| matches!(c, CoreError::PolicyDenied { .. })));
}

#[test]
fn s4_cascade_delete_if_mine_removes_lonely_child() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(CreatePolicy::Always, DependencyUpdatePolicy::AllowAll));
    let meter_id = Uuid::new_v4();
    let bm_id = Uuid::new_v4();
    store.add_instance(AppInstance::new(meter_id, "Meter"));
    let bm = AppInstance::new(bm_id, "BatteryMonitor")
        .with_dependencies(vec![Dependency::new("meter", meter_id)]);
    store.add_instance(bm.clone());
    let mut planner = planner(store);

    let values = planner.delete("alice", bm).expect("delete succeeds");

    let deleted: HashSet<Uuid> = values.deleted.iter().map(|i| i.instance_id).collect();
    assert!(deleted.contains(&bm_id));
    assert!(deleted.contains(&meter_id));
}

#[test]
fn s4_cascade_delete_if_mine_keeps_shared_child() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(CreatePolicy::Always, DependencyUpdatePolicy::AllowAll));
    let meter_id = Uuid::new_v4();
    let bm_id = Uuid::new_v4();
    let other_id = Uuid::new_v4();
    store.add_instance(AppInstance::new(meter_id, "Meter"));
    let bm = AppInstance::new(bm_id, "BatteryMonitor")
        .with_dependencies(vec![Dependency::new("meter", meter_id)]);
    store.add_instance(bm.clone());
    store.add_instance(
        AppInstance::new(other_id, "BatteryMonitor")
            .with_dependencies(vec![Dependency::new("meter", meter_id)]),
    );
    let mut planner = planner(store);

    let values = planner.delete("alice", bm).expect("delete succeeds");

    let deleted: HashSet<Uuid> = values.deleted.iter().map(|i| i.instance_id).collect();
    assert!(deleted.contains(&bm_id));
    assert!(!deleted.contains(&meter_id));
}

#[test]
fn s5_id_allocation_skips_existing_components() {
    let registry = FixtureComponentRegistry::default();
    registry.insert(ComponentDefinition {
        id: "meter0".into(),
        factory_id: "meter-factory".into(),
        alias: None,
        properties: Properties::new(),
    });
    registry.insert(ComponentDefinition {
        id: "meter1".into(),
        factory_id: "meter-factory".into(),
        alias: None,
        properties: Properties::new(),
    });

    let claimed = HashSet::new();
    let next = registry.next_available_id("meter", 0, &claimed);
    assert_eq!(next, "meter2");
}

#[test]
fn s6_aggregator_failure_joins_messages_and_does_not_leave_scratch() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    let mut planner = TransactionPlanner::new(
        Box::new(store),
        Box::new(AlwaysInstallable),
        Box::new(FixtureComponentRegistry::default()),
        Box::new(EchoTranslator),
        Box::new(RecordingAggregator::new("components")),
        Box::new(RecordingAggregator::failing("scheduler")),
        Box::new(RecordingAggregator::failing("static_ips")),
        "en",
    );

    let instance = AppInstance::new(Uuid::new_v4(), "Meter");
    let err = planner
        .install("alice", instance, meter_app())
        .expect_err("both failing aggregators must be reflected");

    assert_eq!(err.causes().len(), 2);
    assert!(err.joined_message().contains('|'));
    assert!(planner.temporary_apps().is_none());
}

#[test]
fn round_trip_install_then_delete_restores_live_set() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    store.add_app(battery_monitor_app(
        CreatePolicy::IfNotExisting,
        DependencyUpdatePolicy::AllowAll,
    ));
    let mut planner = planner(store);

    let bm_id = Uuid::new_v4();
    let bm = AppInstance::new(bm_id, "BatteryMonitor");
    let installed = planner
        .install(
            "alice",
            bm,
            battery_monitor_app(CreatePolicy::IfNotExisting, DependencyUpdatePolicy::AllowAll),
        )
        .expect("install succeeds");
    assert_eq!(installed.created_or_modified.len(), 2);

    let root = installed.root.expect("root present");
    let deleted = planner.delete("alice", root).expect("delete succeeds");
    assert_eq!(deleted.deleted.len(), 2);
}

#[test]
fn idempotent_update_of_unchanged_instance_creates_and_deletes_nothing() {
    let mut store = FixtureStore::new();
    store.add_app(meter_app());
    let meter_id = Uuid::new_v4();
    let instance = AppInstance::new(meter_id, "Meter");
    store.add_instance(instance.clone());
    let mut planner = planner(store);

    let values = planner
        .update("alice", instance.clone(), instance, meter_app())
        .expect("update succeeds");

    assert!(values.created_or_modified.is_empty());
    assert!(values.deleted.is_empty());
}
