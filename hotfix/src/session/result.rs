//! The immutable outcome of one patch session

use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::HotfixError;

/// Stages of a session, in the order they are reached
///
/// `Done` and `Failed` are terminal. A failed session reports `Failed` as
/// its [`SessionResult::last_stage`] and the stage it completed before
/// failing as [`SessionResult::reached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SessionStage {
    Idle,
    LockAcquired,
    ImageLoaded,
    TargetsResolved,
    ModuleLoaded,
    Validated,
    Paused,
    Patched,
    Done,
    Failed,
}

impl SessionStage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot returned by every session, successful or not
#[derive(Debug, Serialize)]
pub struct SessionResult {
    /// Canonical module path once loaded, the requested path before that
    pub module_path: PathBuf,
    pub thread_safe: bool,
    /// Validated targets in application order; empty if validation was not reached
    pub methods: Vec<String>,
    #[serde(rename = "cost_ms", serialize_with = "as_millis")]
    pub cost: Duration,
    #[serde(serialize_with = "as_display")]
    pub err: Option<HotfixError>,
    /// Session transcript, one line per event
    pub message: String,
    /// `Done` or `Failed`
    pub last_stage: SessionStage,
    /// Last stage completed; `Done` on success
    pub reached: SessionStage,
}

impl SessionResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// # Errors
    /// Returns an error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_millis<S: Serializer>(cost: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(cost.as_micros() as f64 / 1000.0)
}

#[allow(clippy::ref_option)]
fn as_display<S: Serializer>(err: &Option<HotfixError>, serializer: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => serializer.collect_str(err),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(err: Option<HotfixError>) -> SessionResult {
        SessionResult {
            module_path: PathBuf::from("/srv/patch/libfix.so"),
            thread_safe: false,
            methods: vec!["pkg.Foo".to_string()],
            cost: Duration::from_micros(1500),
            last_stage: if err.is_some() { SessionStage::Failed } else { SessionStage::Done },
            reached: if err.is_some() { SessionStage::Validated } else { SessionStage::Done },
            err,
            message: "[hotfix] +0.000s loading main image ...".to_string(),
        }
    }

    #[test]
    fn test_json_success() {
        let json: serde_json::Value = serde_json::from_str(&result(None).to_json().unwrap()).unwrap();
        assert_eq!(json["module_path"], "/srv/patch/libfix.so");
        assert_eq!(json["methods"][0], "pkg.Foo");
        assert_eq!(json["cost_ms"], 1.5);
        assert!(json["err"].is_null());
        assert_eq!(json["last_stage"], "Done");
        assert_eq!(json["reached"], "Done");
    }

    #[test]
    fn test_json_error_is_display_string() {
        let failed = result(Some(HotfixError::EmptyFunctions));
        assert!(!failed.is_ok());
        let json: serde_json::Value = serde_json::from_str(&failed.to_json().unwrap()).unwrap();
        assert_eq!(json["err"], "empty functions");
        assert_eq!(json["last_stage"], "Failed");
        assert_eq!(json["reached"], "Validated");
    }

    #[test]
    fn test_stage_order() {
        assert!(SessionStage::LockAcquired < SessionStage::Validated);
        assert_eq!(SessionStage::ModuleLoaded.to_string(), "ModuleLoaded");
        assert!(SessionStage::Failed.is_terminal());
        assert!(SessionStage::Done.is_terminal());
        assert!(!SessionStage::Patched.is_terminal());
    }
}
