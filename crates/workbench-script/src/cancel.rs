//! Cooperative cancellation for script runs

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use workbench_engine::CancelledOperation;

/// Shared cancellation flag carrying who cancelled and why.
///
/// Clones observe the same flag. Only the first `cancel` is recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
   token: CancellationToken,
   reason: Arc<OnceLock<CancelledOperation>>,
}

impl CancelToken {
   pub fn new() -> Self {
      Self::default()
   }

   /// Request cancellation. Returns false if the token was already cancelled.
   pub fn cancel(&self, operation: CancelledOperation) -> bool {
      // The reason is recorded before waiters wake so they always find it
      let first = self.reason.set(operation).is_ok();
      if first {
         self.token.cancel();
      }
      first
   }

   pub fn is_cancelled(&self) -> bool {
      self.reason.get().is_some()
   }

   pub fn reason(&self) -> Option<CancelledOperation> {
      self.reason.get().cloned()
   }

   /// Wait until the token is cancelled.
   pub async fn cancelled(&self) -> CancelledOperation {
      self.token.cancelled().await;
      self
         .reason()
         .unwrap_or_else(|| CancelledOperation::by_system("cancelled"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Duration;

   #[tokio::test]
   async fn test_cancel_wakes_waiter() {
      let token = CancelToken::new();
      let waiter = tokio::spawn({
         let token = token.clone();
         async move { token.cancelled().await }
      });

      tokio::time::sleep(Duration::from_millis(20)).await;
      assert!(token.cancel(CancelledOperation::by_user("stop")));

      let reason = waiter.await.unwrap();
      assert!(reason.is_user);
      assert_eq!(reason.reason, "stop");
   }

   #[tokio::test]
   async fn test_first_cancel_wins() {
      let token = CancelToken::new();
      assert!(token.cancel(CancelledOperation::by_system("shutdown")));
      assert!(!token.cancel(CancelledOperation::by_user("late")));

      let reason = token.cancelled().await;
      assert!(!reason.is_user);
      assert_eq!(token.reason().map(|r| r.reason).as_deref(), Some("shutdown"));
   }

   #[tokio::test]
   async fn test_every_clone_wakes_with_the_reason() {
      let token = CancelToken::new();
      let waiters: Vec<_> = (0..4)
         .map(|_| {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
         })
         .collect();

      tokio::task::yield_now().await;
      token.cancel(CancelledOperation::by_user("stop"));

      for waiter in waiters {
         let reason = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
         assert_eq!(reason.reason, "stop");
      }
   }
}
