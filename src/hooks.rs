use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::types::{ExceptionCategory, PhaseFailureKind};

/// Default per-handler timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// In-process lifecycle hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    BeforeTaskStart,
    AfterTaskDone,
    OnRecovery,
    OnCiFailed,
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookName::BeforeTaskStart => "before_task_start",
            HookName::AfterTaskDone => "after_task_done",
            HookName::OnRecovery => "on_recovery",
            HookName::OnCiFailed => "on_ci_failed",
        };
        write!(f, "{}", s)
    }
}

/// Strictly-shaped payload per hook. The variant must match the hook being
/// dispatched; a mismatch is rejected before any handler runs.
#[derive(Debug, Clone, PartialEq)]
pub enum HookPayload {
    BeforeTaskStart {
        phase_id: Uuid,
        task_id: Uuid,
        title: String,
    },
    AfterTaskDone {
        phase_id: Uuid,
        task_id: Uuid,
        title: String,
    },
    OnRecovery {
        phase_id: Uuid,
        category: ExceptionCategory,
        attempt_number: u32,
    },
    OnCiFailed {
        phase_id: Uuid,
        failure_kind: PhaseFailureKind,
        context: String,
    },
}

impl HookPayload {
    pub fn hook_name(&self) -> HookName {
        match self {
            HookPayload::BeforeTaskStart { .. } => HookName::BeforeTaskStart,
            HookPayload::AfterTaskDone { .. } => HookName::AfterTaskDone,
            HookPayload::OnRecovery { .. } => HookName::OnRecovery,
            HookPayload::OnCiFailed { .. } => HookName::OnCiFailed,
        }
    }
}

pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type HookHandler = Box<dyn Fn(HookPayload) -> HookFuture + Send + Sync>;

/// Structured failure from hook dispatch. The first failing handler aborts
/// the remaining handlers for that dispatch.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error(
    "Lifecycle hook '{hook_name}' handler '{registration_id}' failed after {duration_ms}ms (timeout {timeout_ms}ms): {cause}"
)]
pub struct LifecycleHookExecutionError {
    pub hook_name: String,
    pub registration_id: String,
    pub timeout_ms: u64,
    pub duration_ms: u64,
    pub cause: String,
}

/// Registry of named, deterministically-ordered in-process hook handlers.
///
/// Handlers run sequentially in registration order. Each handler is bounded
/// by the registry timeout; a timeout or error aborts the remaining
/// handlers and surfaces a `LifecycleHookExecutionError`.
pub struct LifecycleHookRegistry {
    handlers: HashMap<HookName, Vec<(String, HookHandler)>>,
    timeout: Duration,
}

impl Default for LifecycleHookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleHookRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Register a handler under a registry-unique ID. Duplicate IDs fail
    /// fast.
    pub fn register(
        &mut self,
        hook: HookName,
        registration_id: &str,
        handler: HookHandler,
    ) -> Result<(), String> {
        let duplicate = self
            .handlers
            .values()
            .flatten()
            .any(|(id, _)| id == registration_id);
        if duplicate {
            return Err(format!(
                "Hook registration ID '{}' is already in use",
                registration_id
            ));
        }

        self.handlers
            .entry(hook)
            .or_default()
            .push((registration_id.to_string(), handler));
        Ok(())
    }

    pub fn handler_count(&self, hook: HookName) -> usize {
        self.handlers.get(&hook).map(|v| v.len()).unwrap_or(0)
    }

    /// Dispatch a payload to every handler registered for `hook`.
    pub async fn dispatch(
        &self,
        hook: HookName,
        payload: &HookPayload,
    ) -> Result<(), LifecycleHookExecutionError> {
        if payload.hook_name() != hook {
            return Err(LifecycleHookExecutionError {
                hook_name: hook.to_string(),
                registration_id: "(payload-validation)".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
                duration_ms: 0,
                cause: format!(
                    "payload for '{}' does not match hook '{}'",
                    payload.hook_name(),
                    hook
                ),
            });
        }

        let Some(handlers) = self.handlers.get(&hook) else {
            return Ok(());
        };

        for (registration_id, handler) in handlers {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, handler(payload.clone())).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let cause = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(message)) => message,
                Err(_) => "handler timed out".to_string(),
            };

            return Err(LifecycleHookExecutionError {
                hook_name: hook.to_string(),
                registration_id: registration_id.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
                duration_ms,
                cause,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn payload() -> HookPayload {
        HookPayload::BeforeTaskStart {
            phase_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            title: "t".to_string(),
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> HookHandler {
        Box::new(move |_| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = LifecycleHookRegistry::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let name = name.to_string();
            registry
                .register(
                    HookName::BeforeTaskStart,
                    &name.clone(),
                    Box::new(move |_| {
                        let order = Arc::clone(&order);
                        let name = name.clone();
                        Box::pin(async move {
                            order.lock().unwrap().push(name);
                            Ok(())
                        })
                    }),
                )
                .unwrap();
        }

        registry
            .dispatch(HookName::BeforeTaskStart, &payload())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn duplicate_registration_id_fails_fast() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = LifecycleHookRegistry::new();
        registry
            .register(
                HookName::BeforeTaskStart,
                "dup",
                counting_handler(Arc::clone(&counter)),
            )
            .unwrap();
        let err = registry
            .register(HookName::AfterTaskDone, "dup", counting_handler(counter))
            .unwrap_err();
        assert!(err.contains("dup"));
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_handlers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = LifecycleHookRegistry::new();
        registry
            .register(
                HookName::BeforeTaskStart,
                "boom",
                Box::new(|_| Box::pin(async { Err("exploded".to_string()) })),
            )
            .unwrap();
        registry
            .register(
                HookName::BeforeTaskStart,
                "after",
                counting_handler(Arc::clone(&counter)),
            )
            .unwrap();

        let err = registry
            .dispatch(HookName::BeforeTaskStart, &payload())
            .await
            .unwrap_err();
        assert_eq!(err.registration_id, "boom");
        assert_eq!(err.cause, "exploded");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut registry = LifecycleHookRegistry::with_timeout(Duration::from_millis(50));
        registry
            .register(
                HookName::OnRecovery,
                "slow",
                Box::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    })
                }),
            )
            .unwrap();

        let payload = HookPayload::OnRecovery {
            phase_id: Uuid::new_v4(),
            category: ExceptionCategory::DirtyWorktree,
            attempt_number: 1,
        };
        let err = registry
            .dispatch(HookName::OnRecovery, &payload)
            .await
            .unwrap_err();
        assert_eq!(err.cause, "handler timed out");
        assert_eq!(err.timeout_ms, 50);
    }

    #[tokio::test]
    async fn mismatched_payload_is_rejected_before_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = LifecycleHookRegistry::new();
        registry
            .register(
                HookName::AfterTaskDone,
                "h",
                counting_handler(Arc::clone(&counter)),
            )
            .unwrap();

        let err = registry
            .dispatch(HookName::AfterTaskDone, &payload())
            .await
            .unwrap_err();
        assert!(err.cause.contains("does not match"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
