use avgate_proto::{EventBus, EventKind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MacroError;
use crate::executor::StepExecutor;
use crate::model::{Macro, StepKind};
use crate::store::MacroStore;

#[derive(Debug, Default)]
struct RunState {
    running: Option<String>,
    pending: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub index: usize,
    pub kind: StepKind,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub macro_id: String,
    pub name: String,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.len() - self.failed()
    }
}

/// Clears the running slot when the run task ends, however it ends.
struct RunGuard {
    state: Arc<Mutex<RunState>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.running = None;
    }
}

/// Single-run macro scheduler.
///
/// `run` only records a request. The owning loop calls `poll` on its next
/// iteration, which snapshots the macro and spawns the run on its own task, so
/// callers on network callbacks never wait on sockets or the serial line.
pub struct Scheduler {
    store: Arc<Mutex<MacroStore>>,
    state: Arc<Mutex<RunState>>,
    executor: Arc<StepExecutor>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(store: Arc<Mutex<MacroStore>>, executor: StepExecutor, events: EventBus) -> Self {
        Self { store, state: Arc::new(Mutex::new(RunState::default())), executor: Arc::new(executor), events }
    }

    /// Accepts the request, or `Busy` while another run is active or queued.
    pub fn run(&self, id: &str) -> Result<(), MacroError> {
        let mut st = self.state.lock().unwrap();
        if let Some(active) = st.running.as_ref().or(st.pending.as_ref()) {
            debug!("macro: run {} refused, {} active", id, active);
            return Err(MacroError::Busy { active: active.clone() });
        }
        st.pending = Some(id.to_string());
        info!("macro: run requested {}", id);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running.is_some()
    }

    /// True while a run is executing or waiting for dispatch.
    pub fn is_busy(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.running.is_some() || st.pending.is_some()
    }

    /// Dispatches a pending request, if any. `Ok(None)` means nothing was
    /// queued; `NotFound` means the id vanished before dispatch.
    pub fn poll(&self) -> Result<Option<JoinHandle<RunReport>>, MacroError> {
        let id = {
            let mut st = self.state.lock().unwrap();
            let Some(id) = st.pending.take() else { return Ok(None) };
            st.running = Some(id.clone());
            id
        };
        let guard = RunGuard { state: self.state.clone() };

        let snapshot = self.store.lock().unwrap().get(&id);
        let Some(snapshot) = snapshot else {
            warn!("macro: not found: {}", id);
            drop(guard);
            return Err(MacroError::NotFound(id));
        };

        let executor = self.executor.clone();
        let events = self.events.clone();
        Ok(Some(tokio::spawn(execute(snapshot, executor, events, guard))))
    }
}

async fn execute(snapshot: Macro, executor: Arc<StepExecutor>, events: EventBus, _guard: RunGuard) -> RunReport {
    let started_at = OffsetDateTime::now_utc();
    let started = Instant::now();
    info!("macro: ▶ {} ({} steps)", snapshot.name, snapshot.steps.len());
    events.emit(EventKind::MacroStarted {
        id: snapshot.id.clone(),
        name: snapshot.name.clone(),
        step_count: snapshot.steps.len(),
    });

    let mut steps = Vec::with_capacity(snapshot.steps.len());
    for (index, step) in snapshot.steps.iter().enumerate() {
        info!("macro:   step {}: {} -> {}", index + 1, step.kind, step.target);

        let report = match executor.execute(step).await {
            Ok(detail) => StepReport { index, kind: step.kind, ok: true, detail },
            Err(e) => {
                warn!("macro:   step {} failed: {}", index + 1, e);
                StepReport { index, kind: step.kind, ok: false, detail: e.to_string() }
            }
        };
        events.emit(EventKind::MacroStep {
            id: snapshot.id.clone(),
            index,
            kind: step.kind.to_string(),
            ok: report.ok,
            detail: report.detail.clone(),
        });
        steps.push(report);

        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
    }

    let report = RunReport {
        macro_id: snapshot.id,
        name: snapshot.name,
        started_at,
        elapsed: started.elapsed(),
        steps,
    };
    info!(
        "macro: ✓ {} complete ({} ok, {} failed, {} ms)",
        report.name,
        report.succeeded(),
        report.failed(),
        report.elapsed.as_millis()
    );
    events.emit(EventKind::MacroFinished {
        id: report.macro_id.clone(),
        ok_steps: report.succeeded(),
        failed_steps: report.failed(),
        elapsed_ms: report.elapsed.as_millis() as u64,
    });
    report
}
