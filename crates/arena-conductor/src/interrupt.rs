//! Interrupt deferral and exit hooks.
//!
//! An [`InterruptGate`] receives process interruptions (SIGINT/SIGTERM via
//! `ctrlc`). While any [`CriticalSection`] is held the interruption is only
//! recorded; it takes effect when the outermost section is released. Taking
//! effect means running every registered exit hook once and then calling the
//! gate's terminator, which for the process-wide gate exits with status 130.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{error, info, warn};

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

type ExitHook = Box<dyn FnOnce() + Send + 'static>;
type Terminator = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExitHookId(u64);

#[derive(Default)]
struct GateState {
    depth: usize,
    pending: bool,
    interrupts: u64,
}

struct GateInner {
    state: Mutex<GateState>,
    hooks: Mutex<BTreeMap<ExitHookId, (String, ExitHook)>>,
    next_hook: AtomicU64,
    terminator: Terminator,
}

#[derive(Clone)]
pub struct InterruptGate {
    inner: Arc<GateInner>,
}

static GLOBAL_GATE: OnceLock<InterruptGate> = OnceLock::new();
static HANDLER_INSTALLED: OnceLock<()> = OnceLock::new();

impl InterruptGate {
    /// Gate that runs `terminator` after the exit hooks when an interruption
    /// takes effect.
    pub fn with_terminator(terminator: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                hooks: Mutex::new(BTreeMap::new()),
                next_hook: AtomicU64::new(1),
                terminator: Box::new(terminator),
            }),
        }
    }

    /// Process-wide gate used by the installed signal handler.
    pub fn global() -> InterruptGate {
        GLOBAL_GATE
            .get_or_init(|| {
                InterruptGate::with_terminator(|| std::process::exit(INTERRUPTED_EXIT_CODE))
            })
            .clone()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enter(&self) -> CriticalSection {
        let mut state = self.state();
        state.depth += 1;
        CriticalSection { gate: self.clone() }
    }

    pub fn in_critical_section(&self) -> bool {
        self.state().depth > 0
    }

    pub fn interrupt_pending(&self) -> bool {
        self.state().pending
    }

    pub fn interrupts_received(&self) -> u64 {
        self.state().interrupts
    }

    /// Delivers one interruption. Deferred while a section is held,
    /// otherwise acted on immediately.
    pub fn interrupt(&self) {
        let mut state = self.state();
        state.interrupts += 1;
        if state.depth > 0 {
            state.pending = true;
            warn!(depth = state.depth, "interrupt deferred until critical section exits");
            return;
        }
        info!("interrupt received outside critical section");
        self.terminate(state);
    }

    fn leave(&self) {
        let mut state = self.state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 && state.pending {
            state.pending = false;
            info!("delivering deferred interrupt");
            self.terminate(state);
        }
    }

    // The state lock stays held until the terminator returns so no new
    // section can start while hooks run.
    fn terminate(&self, _state: MutexGuard<'_, GateState>) {
        self.run_exit_hooks();
        (self.inner.terminator)();
    }

    pub fn register_exit_hook(
        &self,
        label: impl Into<String>,
        hook: impl FnOnce() + Send + 'static,
    ) -> ExitHookId {
        let id = ExitHookId(self.inner.next_hook.fetch_add(1, Ordering::SeqCst));
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (label.into(), Box::new(hook)));
        id
    }

    /// Returns false when the hook already ran or was never registered.
    pub fn unregister_exit_hook(&self, id: ExitHookId) -> bool {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: ExitHookId) -> bool {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    /// Runs a single hook now, removing it from the registry.
    pub fn fire_exit_hook(&self, id: ExitHookId) -> bool {
        let entry = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match entry {
            Some((label, hook)) => {
                info!(hook = %label, "running exit hook");
                run_hook(&label, hook);
                true
            }
            None => false,
        }
    }

    /// Drains and runs every registered hook, newest first.
    pub fn run_exit_hooks(&self) -> usize {
        let drained: Vec<(ExitHookId, (String, ExitHook))> = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *hooks).into_iter().rev().collect()
        };
        let count = drained.len();
        for (_, (label, hook)) in drained {
            info!(hook = %label, "running exit hook");
            run_hook(&label, hook);
        }
        count
    }
}

fn run_hook(label: &str, hook: ExitHook) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)).is_err() {
        error!(hook = %label, "exit hook panicked");
    }
}

/// Scoped guard: interruptions arriving while it is alive are deferred
/// until the outermost guard drops, on every exit path.
#[must_use = "the section ends as soon as the guard is dropped"]
pub struct CriticalSection {
    gate: InterruptGate,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// Routes SIGINT/SIGTERM to the process-wide gate. Safe to call more than
/// once.
pub fn install_interrupt_handler() -> Result<()> {
    if HANDLER_INSTALLED.get().is_some() {
        return Ok(());
    }
    let gate = InterruptGate::global();
    ctrlc::set_handler(move || gate.interrupt())
        .map_err(|e| anyhow!("failed to install interrupt handler: {}", e))?;
    let _ = HANDLER_INSTALLED.set(());
    Ok(())
}
