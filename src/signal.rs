//! Ctrl+C handling.
//!
//! Long operations (rebuilds, fingerprinting, clustering) take an
//! `Arc<AtomicBool>` cancel flag and check it once per entity. The first
//! Ctrl+C sets the flag so the operation can stop cleanly (deleting a partial
//! index, discarding partial clusters). A second Ctrl+C exits immediately
//! with status 130.
//!
//! ```rust,no_run
//! use tagstore::signal::install_handler;
//!
//! let cancel = install_handler().expect("signal handler");
//! // library.rebuild_index(None, Some(cancel.flag()))
//! if cancel.is_cancelled() {
//!     eprintln!("stopped early");
//! }
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::ExitCode;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// The underlying flag, for passing to library operations.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

static GLOBAL: OnceLock<CancelFlag> = OnceLock::new();

/// Install the process-wide Ctrl+C handler, or return the installed one reset.
///
/// # Errors
///
/// [`SignalError::InstallFailed`] if another handler was registered outside
/// this module.
pub fn install_handler() -> Result<CancelFlag, SignalError> {
    if let Some(existing) = GLOBAL.get() {
        existing.reset();
        return Ok(existing.clone());
    }

    let cancel = CancelFlag::new();
    let flag = cancel.flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            let _ = writeln!(std::io::stderr(), "\nAborted.");
            std::process::exit(ExitCode::Interrupted.as_i32());
        }
        let _ = writeln!(
            std::io::stderr(),
            "\nInterrupted. Finishing the current item (press Ctrl+C again to abort)..."
        );
        let _ = std::io::stderr().flush();
        log::info!("Cancellation requested");
    })?;

    Ok(GLOBAL.get_or_init(|| cancel).clone())
}
