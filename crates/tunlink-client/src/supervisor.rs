//! First-terminator-wins supervisor for the client's service units.
//!
//! Every registered unit is launched on its own task. The supervisor
//! resolves as soon as any one of them returns, and reports that unit's
//! result as the outcome of the whole group. Remaining units are left
//! running; they stop on their own once the shared tunnel is closed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// A service unit body: runs until the tunnel closes or it fails.
pub type UnitFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Aggregated result of a supervised group.
pub struct RunOutcome {
    pub ok: bool,
    /// Display name of the unit that ended the group, if any.
    pub unit: Option<String>,
    pub message: String,
    pub error: Option<anyhow::Error>,
}

impl RunOutcome {
    pub(crate) fn finished(unit: &str) -> Self {
        Self {
            ok: true,
            unit: Some(unit.to_string()),
            message: format!("{unit} finished without error"),
            error: None,
        }
    }

    pub(crate) fn failed(unit: &str, error: anyhow::Error) -> Self {
        Self {
            ok: false,
            unit: Some(unit.to_string()),
            message: format!("failed to run {unit}"),
            error: Some(error),
        }
    }

    /// The group ended without any unit reporting back.
    pub(crate) fn lost() -> Self {
        Self {
            ok: false,
            unit: None,
            message: "service units stopped without reporting".to_string(),
            error: None,
        }
    }

    fn empty() -> Self {
        Self {
            ok: true,
            unit: None,
            message: "no modes to run".to_string(),
            error: None,
        }
    }
}

impl fmt::Debug for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOutcome")
            .field("ok", &self.ok)
            .field("unit", &self.unit)
            .field("message", &self.message)
            .field("error", &self.error.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(e) => write!(f, "{}: {e:#}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

struct Registration {
    name: String,
    unit: UnitFuture,
}

/// Runs a set of named units concurrently; the first to return wins.
#[derive(Default)]
pub struct ModeSupervisor {
    units: Vec<Registration>,
}

impl ModeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. Units launch in registration order.
    pub fn add<F>(&mut self, name: impl Into<String>, unit: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(unit = %name, "Registered service unit");
        self.units.push(Registration {
            name,
            unit: Box::pin(unit),
        });
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Display names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|r| r.name.as_str()).collect()
    }

    /// Launch every unit and wait for the first one to terminate.
    ///
    /// With no units registered this returns a success outcome immediately.
    pub async fn run(self) -> RunOutcome {
        if self.units.is_empty() {
            return RunOutcome::empty();
        }

        // Capacity covers every unit, so late finishers never block.
        let (tx, mut rx) = mpsc::channel::<RunOutcome>(self.units.len());

        for Registration { name, unit } in self.units {
            let tx = tx.clone();
            info!(unit = %name, "Starting service unit");
            tokio::spawn(async move {
                let outcome = match tokio::spawn(unit).await {
                    Ok(Ok(())) => RunOutcome::finished(&name),
                    Ok(Err(e)) => RunOutcome::failed(&name, e),
                    Err(join_err) => RunOutcome::failed(
                        &name,
                        anyhow::anyhow!("service unit panicked: {join_err}"),
                    ),
                };
                if tx.try_send(outcome).is_err() {
                    debug!(unit = %name, "Supervisor already finished, discarding outcome");
                }
            });
        }
        drop(tx);

        // `None` only if every reporter task was torn down with the runtime.
        rx.recv().await.unwrap_or_else(RunOutcome::lost)
    }
}
