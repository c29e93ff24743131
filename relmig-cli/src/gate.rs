//! Constraint gate: scoped suspension of referential-integrity enforcement
//!
//! Enforcement is off only while one table loads. [`ConstraintGate::scoped`]
//! restores it on every exit path (success, error or panic) and verifies
//! the target reports enforcement back on before handing back the result.

use anyhow::Result;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::error::MigrationError;
use crate::target::TargetStore;

/// Single-holder gate over the target's integrity enforcement
#[derive(Clone)]
pub struct ConstraintGate {
    target: Arc<dyn TargetStore>,
    holder: Arc<Mutex<Option<String>>>,
}

impl ConstraintGate {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self {
            target,
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Table currently holding the gate, if any
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().ok().and_then(|h| h.clone())
    }

    fn release(&self) {
        if let Ok(mut holder) = self.holder.lock() {
            *holder = None;
        }
    }

    /// Suspend enforcement for `table`.
    ///
    /// Fails with an integrity-gate error if another table holds the gate or
    /// the target refuses.
    pub async fn suspend(&self, table: &str) -> Result<GateGuard> {
        {
            let mut holder = self
                .holder
                .lock()
                .map_err(|_| MigrationError::IntegrityGate("gate state poisoned".to_string()))?;
            if let Some(current) = holder.as_ref() {
                return Err(MigrationError::IntegrityGate(format!(
                    "cannot suspend for {}: gate already held by {}",
                    table, current
                ))
                .into());
            }
            *holder = Some(table.to_string());
        }

        if let Err(e) = self.target.set_integrity_enforcement(false).await {
            self.release();
            return Err(MigrationError::IntegrityGate(format!(
                "cannot suspend enforcement for {}: {:#}",
                table, e
            ))
            .into());
        }

        log::debug!("Integrity enforcement suspended for {}", table);
        Ok(GateGuard {
            gate: self.clone(),
            table: table.to_string(),
            restored: false,
        })
    }

    /// Run `work` with enforcement suspended, restoring it afterwards.
    ///
    /// A restore failure outranks whatever `work` returned. A panic inside
    /// `work` is resumed only after enforcement is back on.
    pub async fn scoped<F, Fut, T>(&self, table: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.suspend(table).await?;
        let outcome = AssertUnwindSafe(work()).catch_unwind().await;

        if outcome.is_err() {
            log::error!("Load of {} panicked; restoring integrity enforcement", table);
        }
        guard.restore().await?;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Proof that enforcement is suspended; restores on [`GateGuard::restore`]
/// or, as a last resort, on drop
pub struct GateGuard {
    gate: ConstraintGate,
    table: String,
    restored: bool,
}

impl GateGuard {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Turn enforcement back on and verify it took effect
    pub async fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        let target = &self.gate.target;
        let result = match target.set_integrity_enforcement(true).await {
            Ok(()) => match target.integrity_enforced().await {
                Ok(true) => Ok(()),
                Ok(false) => Err("target still reports enforcement off".to_string()),
                Err(e) => Err(format!("{:#}", e)),
            },
            Err(e) => Err(format!("{:#}", e)),
        };
        self.gate.release();

        match result {
            Ok(()) => {
                log::debug!("Integrity enforcement restored after {}", self.table);
                Ok(())
            }
            Err(detail) => {
                log::error!(
                    "Failed to restore integrity enforcement after {}: {}",
                    self.table,
                    detail
                );
                Err(MigrationError::IntegrityGate(format!(
                    "cannot restore enforcement after {}: {}",
                    self.table, detail
                ))
                .into())
            }
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        log::error!(
            "Gate for {} dropped without restore; re-enabling enforcement in background",
            self.table
        );
        self.gate.release();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let target = self.gate.target.clone();
            let table = self.table.clone();
            handle.spawn(async move {
                if let Err(e) = target.set_integrity_enforcement(true).await {
                    log::error!("Background restore after {} failed: {:#}", table, e);
                }
            });
        }
    }
}
