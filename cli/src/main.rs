//! Demo binary: loads a small JSON fixture describing an app catalog and a live instance set, runs
//! one install/update/delete request against a `TransactionPlanner`, and prints the resulting
//! `UpdateValues`. See <https://docs.rs/clap/latest/clap/_derive/index.html>.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use edge_app_planner::fixtures::{
    AlwaysInstallable, EchoTranslator, FixtureComponentRegistry, FixtureStore, RecordingAggregator,
};
use edge_app_planner::{
    App, AppConfiguration, AppDependencyConfig, AppInstance, ComponentDefinition, CreatePolicy,
    Dependency, DependencyDeclaration, DependencyDeletePolicy, DependencyUpdatePolicy,
    DeletePolicy, Properties, TransactionPlanner, UpdatePolicy,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Parser)]
struct Args {
    /// Path to a PlannerFixture JSON file describing the catalog and live instances.
    #[arg(long)]
    fixture: PathBuf,

    /// Which request to run against the loaded fixture.
    #[arg(long, value_enum)]
    request: RequestKind,

    /// Instance id (within the fixture) the request targets.
    #[arg(long)]
    instance: String,

    /// User performing the request, forwarded to the aggregators on commit.
    #[arg(long, default_value = "cli")]
    user: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum RequestKind {
    Install,
    Update,
    Delete,
}

#[derive(Deserialize)]
struct PlannerFixture {
    apps: Vec<FixtureApp>,
    #[serde(default)]
    instances: Vec<FixtureInstance>,
}

#[derive(Deserialize)]
struct FixtureApp {
    app_id: String,
    #[serde(default)]
    dependencies: Vec<FixtureDeclaration>,
    #[serde(default)]
    persistable_properties: Vec<String>,
    components: Vec<ComponentDefinition>,
    #[serde(default)]
    scheduler_order: Vec<String>,
}

#[derive(Deserialize)]
struct FixtureDeclaration {
    key: String,
    alternatives: Vec<FixtureAlternative>,
    create_policy: CreatePolicy,
    update_policy: UpdatePolicy,
    delete_policy: DeletePolicy,
    dependency_update_policy: DependencyUpdatePolicy,
    dependency_delete_policy: DependencyDeletePolicy,
}

#[derive(Deserialize)]
struct FixtureAlternative {
    app_id: String,
    #[serde(default)]
    properties: Properties,
}

#[derive(Deserialize)]
struct FixtureInstance {
    instance_id: Uuid,
    app_id: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    dependencies: HashMap<String, Uuid>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let raw = fs::read_to_string(&args.fixture)?;
    let fixture: PlannerFixture = serde_json::from_str(&raw)?;

    let mut store = FixtureStore::new();
    for app in &fixture.apps {
        store.add_app(build_app(app));
    }
    let instance_id: Uuid = args.instance.parse()?;
    for instance in &fixture.instances {
        store.add_instance(AppInstance {
            instance_id: instance.instance_id,
            app_id: instance.app_id.clone(),
            alias: instance.alias.clone(),
            properties: instance.properties.clone(),
            dependencies: instance
                .dependencies
                .iter()
                .map(|(key, target)| Dependency::new(key.clone(), *target))
                .collect(),
        });
    }

    let mut planner = TransactionPlanner::new(
        Box::new(store),
        Box::new(AlwaysInstallable),
        Box::new(FixtureComponentRegistry::new()),
        Box::new(EchoTranslator),
        Box::new(RecordingAggregator::new("components")),
        Box::new(RecordingAggregator::new("scheduler")),
        Box::new(RecordingAggregator::new("static_ips")),
        "en",
    );

    let result = match args.request {
        RequestKind::Install => {
            let fixture_app = fixture
                .apps
                .iter()
                .find(|a| {
                    fixture
                        .instances
                        .iter()
                        .any(|i| i.instance_id == instance_id && i.app_id == a.app_id)
                })
                .ok_or_else(|| anyhow::anyhow!("no instance '{instance_id}' in fixture"))?;
            let app = build_app(fixture_app);
            let instance = AppInstance::new(instance_id, &fixture_app.app_id);
            planner.install(&args.user, instance, app)
        }
        RequestKind::Update => {
            let fixture_instance = fixture
                .instances
                .iter()
                .find(|i| i.instance_id == instance_id)
                .ok_or_else(|| anyhow::anyhow!("no instance '{instance_id}' in fixture"))?;
            let fixture_app = fixture
                .apps
                .iter()
                .find(|a| a.app_id == fixture_instance.app_id)
                .ok_or_else(|| anyhow::anyhow!("no app '{}' in fixture", fixture_instance.app_id))?;
            let app = build_app(fixture_app);
            let old = AppInstance {
                instance_id: fixture_instance.instance_id,
                app_id: fixture_instance.app_id.clone(),
                alias: fixture_instance.alias.clone(),
                properties: fixture_instance.properties.clone(),
                dependencies: fixture_instance
                    .dependencies
                    .iter()
                    .map(|(key, target)| Dependency::new(key.clone(), *target))
                    .collect(),
            };
            let new = old.clone();
            planner.update(&args.user, old, new, app)
        }
        RequestKind::Delete => {
            let fixture_instance = fixture
                .instances
                .iter()
                .find(|i| i.instance_id == instance_id)
                .ok_or_else(|| anyhow::anyhow!("no instance '{instance_id}' in fixture"))?;
            let instance = AppInstance {
                instance_id: fixture_instance.instance_id,
                app_id: fixture_instance.app_id.clone(),
                alias: fixture_instance.alias.clone(),
                properties: fixture_instance.properties.clone(),
                dependencies: fixture_instance
                    .dependencies
                    .iter()
                    .map(|(key, target)| Dependency::new(key.clone(), *target))
                    .collect(),
            };
            planner.delete(&args.user, instance)
        }
    };

    match result {
        Ok(values) => {
            println!("{values:#?}");
            Ok(())
        }
        Err(joined) => {
            eprintln!("{joined}");
            std::process::exit(1);
        }
    }
}

fn build_app(fixture_app: &FixtureApp) -> App {
    let app_id = fixture_app.app_id.clone();
    let components = fixture_app.components.clone();
    let scheduler_order = fixture_app.scheduler_order.clone();
    let dependencies: Vec<DependencyDeclaration> = fixture_app
        .dependencies
        .iter()
        .map(|decl| DependencyDeclaration {
            key: decl.key.clone(),
            alternatives: decl
                .alternatives
                .iter()
                .map(|alt| AppDependencyConfig::by_app(alt.app_id.clone()).with_properties(alt.properties.clone()))
                .collect(),
            create_policy: decl.create_policy,
            update_policy: decl.update_policy,
            delete_policy: decl.delete_policy,
            dependency_update_policy: decl.dependency_update_policy,
            dependency_delete_policy: decl.dependency_delete_policy,
        })
        .collect();
    let persistable_properties = fixture_app.persistable_properties.iter().cloned().collect();

    App::new(
        app_id,
        dependencies,
        persistable_properties,
        Default::default(),
        move |_target, _alias, _properties, _language| {
            Ok(AppConfiguration {
                components: components.clone(),
                scheduler_order: scheduler_order.clone(),
                network_interfaces: Vec::new(),
                dependencies: Vec::new(),
            })
        },
    )
}
