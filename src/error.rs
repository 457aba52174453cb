//! Crate-wide error types. One `thiserror` variant per distinct failure kind from spec §7, plus
//! a `JoinedError` aggregate that mirrors the teacher's `AggregateGraphQLError`: several causes
//! collected during one phase, displayed indented and also available pre-joined by `" | "` for
//! single-line callers (log lines, `UpdateValues`-adjacent diagnostics).

use std::fmt::{self, Write as _};

use crate::store::Translator;
use crate::types::{AppId, InstanceId};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("app {app_id} is not compatible with the current edge configuration")]
    NotCompatible { app_id: AppId },

    #[error("app {app_id} is not installable")]
    NotInstallable { app_id: AppId },

    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("app not found: {app_id}")]
    AppNotFound { app_id: AppId },

    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: InstanceId },

    #[error("render failed for instance {instance_id}: {message}")]
    RenderFailed {
        instance_id: InstanceId,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("aggregator {aggregator} failed to commit: {message}")]
    AggregatorFailed {
        aggregator: &'static str,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal {
            message: message.into(),
        }
    }

    pub fn policy_denied(reason: impl Into<String>) -> Self {
        CoreError::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// The developer-facing `Display` string, already suitable for logs. A caller that needs the
    /// end-user-facing string instead should route through `Translator` using a key derived from
    /// the variant, rather than this method — this crate does not maintain its own locale catalog.
    pub fn developer_message(&self) -> String {
        self.to_string()
    }

    /// The user-facing counterpart to `developer_message`/`Display`: routes through `translator`
    /// instead of building an English sentence, so a caller presenting this error to an end user
    /// (rather than a log line) gets copy in `locale`. Unmapped internal failures (`Internal`,
    /// `RenderFailed`, `AggregatorFailed`) fall back to the developer message, matching the
    /// teacher's treatment of unclassified errors as developer-only detail.
    pub fn localized_message(&self, translator: &dyn Translator, locale: &str) -> String {
        match self {
            CoreError::NotCompatible { app_id } => {
                translator.translate(locale, "error.not_compatible", &[app_id])
            }
            CoreError::NotInstallable { app_id } => {
                translator.translate(locale, "error.not_installable", &[app_id])
            }
            CoreError::PolicyDenied { reason } => {
                translator.translate(locale, "error.policy_denied", &[reason])
            }
            CoreError::AppNotFound { app_id } => {
                translator.translate(locale, "error.app_not_found", &[app_id])
            }
            CoreError::InstanceNotFound { instance_id } => {
                translator.translate(locale, "error.instance_not_found", &[&instance_id.to_string()])
            }
            CoreError::RenderFailed { .. }
            | CoreError::AggregatorFailed { .. }
            | CoreError::Internal { .. } => self.developer_message(),
        }
    }
}

/// A non-empty collection of `CoreError`s accumulated across a phase (one traversal, or the three
/// aggregator commits) and raised together. `Display` writes each cause indented on its own line;
/// `joined_message` gives the flat `" | "`-separated form spec §4.4/§7 call for.
#[derive(Debug)]
pub struct JoinedError {
    causes: Vec<CoreError>,
}

impl JoinedError {
    /// Panics if `causes` is empty — callers should always check before constructing one; see
    /// `JoinedError::from_results` for the usual entry point instead.
    pub fn new(causes: Vec<CoreError>) -> Self {
        assert!(!causes.is_empty(), "JoinedError requires at least one cause");
        Self { causes }
    }

    pub fn causes(&self) -> &[CoreError] {
        &self.causes
    }

    pub fn joined_message(&self) -> String {
        self.causes
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Drains `results` fully (lenient aggregation, per the spec's §9 open question), returning
    /// `Ok` with every success if there were no failures, or a `JoinedError` over every failure
    /// otherwise. Never short-circuits.
    pub fn from_results<T>(
        results: impl IntoIterator<Item = std::result::Result<T, CoreError>>,
    ) -> std::result::Result<Vec<T>, JoinedError> {
        let mut oks = Vec::new();
        let mut errs = Vec::new();
        for result in results {
            match result {
                Ok(value) => oks.push(value),
                Err(err) => errs.push(err),
            }
        }
        if errs.is_empty() {
            Ok(oks)
        } else {
            Err(JoinedError::new(errs))
        }
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.causes.len())?;
        for cause in &self.causes {
            write!(f, "\n\n  - ")?;
            for c in cause.to_string().chars() {
                if c == '\n' {
                    write!(f, "\n    ")?;
                } else {
                    f.write_char(c)?;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}

impl From<CoreError> for JoinedError {
    fn from(err: CoreError) -> Self {
        JoinedError::new(vec![err])
    }
}
