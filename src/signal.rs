//! Termination signals as cooperative cancellation.
//!
//! The first SIGINT/SIGTERM flips the job's [`CancelToken`], letting a download
//! or migration stop at its next boundary. A second signal exits immediately
//! with code 1.

use crate::cancel::CancelToken;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::Arc;

/// Route termination signals into `token`.
pub fn cancel_on_signal(token: &CancelToken) -> Result<(), std::io::Error> {
    let cancelled = token.flag();

    for sig in TERM_SIGNALS {
        // Armed only once the flag is already set, i.e. on the second signal.
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&cancelled))?;
        flag::register(*sig, Arc::clone(&cancelled))?;
    }

    Ok(())
}
