//! Dependency-graph traversal and transaction planning for edge-appliance apps: given a catalog of
//! `App`s and their declared dependencies, resolves a desired install/update/delete into a batch
//! of live `AppInstance` changes, respects each declaration's create/update/delete policies, keeps
//! component ids stable across re-renders, and feeds the result to three pluggable aggregators.
//!
//! The core never talks to a database, a scheduler, or a component registry directly — those are
//! the trait boundaries in `store` and `aggregator`, implemented by the host application. The
//! `fixtures` module supplies in-memory stand-ins for tests and for the `cli` demo.

pub mod aggregator;
pub mod dependency_resolver;
pub mod error;
pub mod fixtures;
pub mod graph_walker;
pub mod id_reconciler;
pub mod policy;
pub mod store;
pub mod transaction;
pub mod transaction_planner;
pub mod types;

pub use crate::aggregator::Aggregator;
pub use crate::error::{CoreError, JoinedError, Result};
pub use crate::store::{AppStore, ComponentRegistry, Translator, Validator, ValidatorStatus};
pub use crate::transaction::{TemporaryApps, Transaction};
pub use crate::transaction_planner::TransactionPlanner;
pub use crate::types::{
    App, AppConfiguration, AppDependencyConfig, AppId, AppInstance, ComponentDefinition,
    ConfigurationTarget, CreatePolicy, Dependency, DependencyDeclaration, DependencyDeletePolicy,
    DependencyUpdatePolicy, DeletePolicy, InstanceId, Language, NetworkInterfaceConfig,
    Properties, UpdatePolicy, UpdateValues, ValidatorConfig, Warning,
};
