use crate::error::ConductorError;
use crate::interrupt::{ExitHookId, InterruptGate};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Applies and undoes one fault in the environment.
pub trait FaultInjector: Send + Sync {
    fn inject_fault(&self) -> Result<()>;
    fn recover_fault(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTransition {
    Applied,
    AlreadyInjected,
    NotInjected,
}

/// Tracks whether a problem's fault is live so injection and recovery each
/// run at most once per cycle.
///
/// The marker is set before the injector runs: a failed or partial
/// injection still counts as injected and will be recovered. A failed
/// recovery leaves the marker set so a later attempt can retry.
pub struct FaultGuard {
    problem_id: String,
    injector: Arc<dyn FaultInjector>,
    injected: Mutex<bool>,
}

impl FaultGuard {
    pub fn new(problem_id: impl Into<String>, injector: Arc<dyn FaultInjector>) -> Self {
        Self {
            problem_id: problem_id.into(),
            injector,
            injected: Mutex::new(false),
        }
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn is_injected(&self) -> bool {
        *self.injected.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self) -> Result<FaultTransition, ConductorError> {
        let mut injected = self.injected.lock().unwrap_or_else(|e| e.into_inner());
        if *injected {
            warn!(problem_id = %self.problem_id, "fault already injected; skipping");
            return Ok(FaultTransition::AlreadyInjected);
        }
        *injected = true;
        info!(problem_id = %self.problem_id, "injecting fault");
        self.injector
            .inject_fault()
            .map_err(|e| ConductorError::FaultInjection {
                problem_id: self.problem_id.clone(),
                message: format!("{:#}", e),
            })?;
        Ok(FaultTransition::Applied)
    }

    pub fn recover(&self) -> Result<FaultTransition, ConductorError> {
        let mut injected = self.injected.lock().unwrap_or_else(|e| e.into_inner());
        if !*injected {
            return Ok(FaultTransition::NotInjected);
        }
        info!(problem_id = %self.problem_id, "recovering fault");
        match self.injector.recover_fault() {
            Ok(()) => {
                *injected = false;
                Ok(FaultTransition::Applied)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(problem_id = %self.problem_id, error = %message, "fault recovery failed");
                Err(ConductorError::FaultRecovery {
                    problem_id: self.problem_id.clone(),
                    message,
                })
            }
        }
    }
}

/// Ties a live fault to an exit hook on the interrupt gate.
///
/// `inject` applies the fault and registers the recovery hook inside one
/// critical section; `release` recovers and unregisters inside another. If
/// the lease is dropped while the hook is still registered (error path,
/// panic, failed recovery) the hook fires once more from `Drop`.
pub struct FaultLease {
    gate: InterruptGate,
    guard: Arc<FaultGuard>,
    hook: Option<ExitHookId>,
}

impl FaultLease {
    pub fn new(gate: InterruptGate, guard: Arc<FaultGuard>) -> Self {
        Self {
            gate,
            guard,
            hook: None,
        }
    }

    pub fn guard(&self) -> &Arc<FaultGuard> {
        &self.guard
    }

    pub fn is_armed(&self) -> bool {
        self.hook.is_some_and(|id| self.gate.is_registered(id))
    }

    pub fn inject(&mut self) -> Result<FaultTransition, ConductorError> {
        let _section = self.gate.enter();
        let outcome = self.guard.inject();
        if self.guard.is_injected() && self.hook.is_none() {
            let guard = self.guard.clone();
            let label = format!("recover_fault:{}", guard.problem_id());
            self.hook = Some(self.gate.register_exit_hook(label, move || {
                info!(problem_id = %guard.problem_id(), "recovering fault before exit");
                if let Err(err) = guard.recover() {
                    error!(error = %err, "exit-time fault recovery failed");
                }
            }));
        }
        outcome
    }

    /// Recovers the fault. On failure the exit hook stays registered so the
    /// fallback makes one more attempt.
    pub fn release(&mut self) -> Result<FaultTransition, ConductorError> {
        let _section = self.gate.enter();
        let outcome = self.guard.recover()?;
        if let Some(id) = self.hook.take() {
            self.gate.unregister_exit_hook(id);
        }
        Ok(outcome)
    }
}

impl Drop for FaultLease {
    fn drop(&mut self) {
        if let Some(id) = self.hook.take() {
            if self.gate.is_registered(id) {
                warn!(problem_id = %self.guard.problem_id(), "fault lease dropped while armed; running fallback recovery");
                let _section = self.gate.enter();
                self.gate.fire_exit_hook(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingInjector {
        injects: AtomicUsize,
        recovers: AtomicUsize,
        fail_recoveries: AtomicUsize,
    }

    impl FaultInjector for CountingInjector {
        fn inject_fault(&self) -> Result<()> {
            self.injects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn recover_fault(&self) -> Result<()> {
            self.recovers.fetch_add(1, Ordering::SeqCst);
            if self.fail_recoveries.load(Ordering::SeqCst) > 0 {
                self.fail_recoveries.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!("kubectl: connection refused"));
            }
            Ok(())
        }
    }

    fn quiet_gate() -> InterruptGate {
        InterruptGate::with_terminator(|| {})
    }

    #[test]
    fn double_inject_and_double_recover_are_no_ops() {
        let injector = Arc::new(CountingInjector::default());
        let guard = FaultGuard::new("p", injector.clone());
        assert_eq!(guard.inject().expect("inject"), FaultTransition::Applied);
        assert_eq!(guard.inject().expect("inject"), FaultTransition::AlreadyInjected);
        assert_eq!(injector.injects.load(Ordering::SeqCst), 1);

        assert_eq!(guard.recover().expect("recover"), FaultTransition::Applied);
        assert_eq!(guard.recover().expect("recover"), FaultTransition::NotInjected);
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_recovery_keeps_marker_for_retry() {
        let injector = Arc::new(CountingInjector::default());
        injector.fail_recoveries.store(1, Ordering::SeqCst);
        let guard = FaultGuard::new("p", injector.clone());
        guard.inject().expect("inject");
        let err = guard.recover().expect_err("first recovery fails");
        assert!(matches!(err, ConductorError::FaultRecovery { .. }));
        assert!(guard.is_injected());
        assert_eq!(guard.recover().expect("retry"), FaultTransition::Applied);
        assert!(!guard.is_injected());
    }

    #[test]
    fn released_lease_does_not_fire_again_on_drop_or_exit() {
        let gate = quiet_gate();
        let injector = Arc::new(CountingInjector::default());
        let guard = Arc::new(FaultGuard::new("p", injector.clone()));
        let mut lease = FaultLease::new(gate.clone(), guard);
        lease.inject().expect("inject");
        assert!(lease.is_armed());
        lease.release().expect("release");
        assert!(!lease.is_armed());
        drop(lease);
        gate.run_exit_hooks();
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_armed_lease_recovers_once() {
        let gate = quiet_gate();
        let injector = Arc::new(CountingInjector::default());
        let guard = Arc::new(FaultGuard::new("p", injector.clone()));
        {
            let mut lease = FaultLease::new(gate.clone(), guard.clone());
            lease.inject().expect("inject");
        }
        gate.run_exit_hooks();
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
        assert!(!guard.is_injected());
    }

    #[test]
    fn interrupt_recovers_through_exit_hook() {
        let gate = quiet_gate();
        let injector = Arc::new(CountingInjector::default());
        let guard = Arc::new(FaultGuard::new("p", injector.clone()));
        let mut lease = FaultLease::new(gate.clone(), guard.clone());
        lease.inject().expect("inject");
        gate.interrupt();
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
        // Later normal release finds nothing to do.
        assert_eq!(lease.release().expect("release"), FaultTransition::NotInjected);
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_release_leaves_one_fallback_attempt() {
        let gate = quiet_gate();
        let injector = Arc::new(CountingInjector::default());
        injector.fail_recoveries.store(1, Ordering::SeqCst);
        let guard = Arc::new(FaultGuard::new("p", injector.clone()));
        let mut lease = FaultLease::new(gate.clone(), guard.clone());
        lease.inject().expect("inject");
        assert!(lease.release().is_err());
        assert!(lease.is_armed());
        drop(lease);
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 2);
        assert!(!guard.is_injected());
        assert_eq!(gate.run_exit_hooks(), 0);
    }

    struct InterruptingInjector {
        gate: InterruptGate,
        terminated: Arc<AtomicUsize>,
        recovers: AtomicUsize,
        terminated_during_recover: AtomicUsize,
    }

    impl FaultInjector for InterruptingInjector {
        fn inject_fault(&self) -> Result<()> {
            Ok(())
        }

        fn recover_fault(&self) -> Result<()> {
            self.recovers.fetch_add(1, Ordering::SeqCst);
            self.gate.interrupt();
            self.terminated_during_recover
                .store(self.terminated.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn interrupt_during_release_is_deferred_and_recovers_once() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let t = terminated.clone();
        let gate = InterruptGate::with_terminator(move || {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let injector = Arc::new(InterruptingInjector {
            gate: gate.clone(),
            terminated: terminated.clone(),
            recovers: AtomicUsize::new(0),
            terminated_during_recover: AtomicUsize::new(0),
        });
        let guard = Arc::new(FaultGuard::new("p", injector.clone()));
        let mut lease = FaultLease::new(gate.clone(), guard.clone());
        lease.inject().expect("inject");

        assert_eq!(lease.release().expect("release"), FaultTransition::Applied);
        assert_eq!(injector.terminated_during_recover.load(Ordering::SeqCst), 0);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
        assert!(!lease.is_armed());
        assert!(!gate.interrupt_pending());

        drop(lease);
        assert_eq!(gate.run_exit_hooks(), 0);
        assert_eq!(injector.recovers.load(Ordering::SeqCst), 1);
        assert!(!guard.is_injected());
    }
}
