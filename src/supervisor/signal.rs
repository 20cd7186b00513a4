//! Platform stop capability: cooperative interrupt and hard kill.
//!
//! The supervisor's state machine is platform-agnostic; only the delivery
//! of the cooperative interrupt differs per target. On unix the interrupt
//! is SIGINT. On other platforms no equivalent console signal can be sent
//! to an arbitrary child, so [`soft_interrupt`] reports non-delivery and
//! the supervisor escalates straight to a hard kill after the grace period.

use tokio::process::Child;

use crate::Result;

/// Deliver a cooperative interrupt to the child, if the platform supports it.
///
/// Returns `true` when a signal was actually delivered (the caller should
/// wait out the grace period before escalating), `false` when the platform
/// has no cooperative interrupt for child processes.
///
/// # Errors
///
/// Returns `AppError::Supervise` when signal delivery itself fails.
#[cfg(unix)]
pub fn soft_interrupt(child: &Child) -> Result<bool> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use crate::AppError;

    let Some(pid) = child.id() else {
        // Already reaped; nothing to signal.
        return Ok(false);
    };

    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Supervise(format!("pid {pid} out of range for signalling")))?;
    kill(Pid::from_raw(raw), Signal::SIGINT)
        .map_err(|err| AppError::Supervise(format!("failed to deliver SIGINT to {pid}: {err}")))?;
    Ok(true)
}

/// Non-unix targets have no cooperative interrupt; report non-delivery.
#[cfg(not(unix))]
pub fn soft_interrupt(_child: &Child) -> Result<bool> {
    Ok(false)
}

/// Hard-kill the child process.
///
/// # Errors
///
/// Returns `AppError::Supervise` when the kill syscall fails.
pub async fn force_kill(child: &mut Child) -> Result<()> {
    use crate::AppError;

    child
        .kill()
        .await
        .map_err(|err| AppError::Supervise(format!("failed to kill child process: {err}")))
}
