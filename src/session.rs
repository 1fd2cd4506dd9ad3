//! Explicit per-session context
//!
//! Bootstrapping state, open script tabs and the user-facing error map live
//! here rather than in process globals, so separate sessions (and tests)
//! never see each other's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};
use workbench_engine::{Classified, DatabaseEngineError};
use workbench_script::ScriptTab;

/// State shared by everything opened against one UI session.
#[derive(Debug)]
pub struct Session {
   id: String,
   bootstrapped: AtomicBool,
   tabs: RwLock<HashMap<String, Arc<ScriptTab>>>,
   errors: RwLock<HashMap<String, DatabaseEngineError>>,
}

impl Default for Session {
   fn default() -> Self {
      Self::new()
   }
}

impl Session {
   pub fn new() -> Self {
      Self {
         id: uuid::Uuid::new_v4().to_string(),
         bootstrapped: AtomicBool::new(false),
         tabs: RwLock::new(HashMap::new()),
         errors: RwLock::new(HashMap::new()),
      }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn is_bootstrapped(&self) -> bool {
      self.bootstrapped.load(Ordering::Acquire)
   }

   /// Claim the session for bootstrapping. False if already claimed.
   pub(crate) fn begin_bootstrap(&self) -> bool {
      !self.bootstrapped.swap(true, Ordering::AcqRel)
   }

   pub(crate) fn reset_bootstrap(&self) {
      self.bootstrapped.store(false, Ordering::Release);
   }

   /// The tab with `id`, registering it on first use.
   pub fn tab(&self, id: &str) -> Arc<ScriptTab> {
      if let Some(tab) = self.tabs.read().get(id) {
         return Arc::clone(tab);
      }
      let mut tabs = self.tabs.write();
      Arc::clone(tabs.entry(id.to_string()).or_insert_with(|| {
         debug!(tab = id, "Registered script tab");
         Arc::new(ScriptTab::new(id))
      }))
   }

   pub fn find_tab(&self, id: &str) -> Option<Arc<ScriptTab>> {
      self.tabs.read().get(id).cloned()
   }

   /// Forget a closed tab along with its recorded error.
   pub fn remove_tab(&self, id: &str) -> Option<Arc<ScriptTab>> {
      self.errors.write().remove(id);
      self.tabs.write().remove(id)
   }

   pub fn tabs(&self) -> Vec<Arc<ScriptTab>> {
      self.tabs.read().values().cloned().collect()
   }

   /// Record a failure for display under `key`.
   ///
   /// Cancellations are not failures and are never recorded. Returns
   /// whether the map changed.
   pub fn record_error(&self, key: &str, classified: Classified) -> bool {
      match classified {
         Classified::Failure(error) => {
            trace!(key, code = %error.code, "Recorded user-facing error");
            self.errors.write().insert(key.to_string(), error);
            true
         }
         Classified::Cancelled(op) => {
            trace!(key, is_user = op.is_user, reason = %op.reason, "Cancellation not recorded");
            false
         }
      }
   }

   pub fn clear_error(&self, key: &str) -> Option<DatabaseEngineError> {
      self.errors.write().remove(key)
   }

   pub fn error(&self, key: &str) -> Option<DatabaseEngineError> {
      self.errors.read().get(key).cloned()
   }

   /// Snapshot of the user-facing error map.
   pub fn user_errors(&self) -> HashMap<String, DatabaseEngineError> {
      self.errors.read().clone()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use workbench_engine::{CancelledOperation, classify};

   #[test]
   fn test_system_cancellation_is_not_a_user_error() {
      let session = Session::new();
      let recorded = session.record_error(
         "tab-1",
         classify(CancelledOperation::by_system("connection recycled")),
      );

      assert!(!recorded);
      assert!(session.user_errors().is_empty());
   }

   #[test]
   fn test_user_cancellation_is_not_recorded_either() {
      let session = Session::new();
      assert!(!session.record_error("tab-1", classify(CancelledOperation::by_user("stop"))));
      assert!(session.error("tab-1").is_none());
   }

   #[test]
   fn test_failures_are_recorded_and_cleared() {
      let session = Session::new();
      assert!(session.record_error("tab-1", classify("Parser Error: syntax error at or near \"SELEC\"")));

      let error = session.error("tab-1").unwrap();
      assert_eq!(error.code, "PARSER_ERROR");

      assert!(session.clear_error("tab-1").is_some());
      assert!(session.user_errors().is_empty());
   }

   #[test]
   fn test_tabs_are_registered_once() {
      let session = Session::new();
      let a = session.tab("a");
      let again = session.tab("a");
      assert!(Arc::ptr_eq(&a, &again));
      assert_eq!(session.tabs().len(), 1);

      assert!(session.remove_tab("a").is_some());
      assert!(session.find_tab("a").is_none());
   }

   #[test]
   fn test_sessions_are_independent() {
      let first = Session::new();
      let second = Session::new();
      assert!(first.begin_bootstrap());
      assert!(!first.begin_bootstrap());
      assert!(!second.is_bootstrapped());
      assert_ne!(first.id(), second.id());
   }
}
