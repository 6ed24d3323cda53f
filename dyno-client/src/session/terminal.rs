//! Terminal mode for interactive sessions.

use crate::Result;
use std::io::IsTerminal;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

/// Puts stdin into non-canonical, no-echo mode; restores it on drop.
///
/// When stdin is not a terminal the guard does nothing.
pub struct RawModeGuard {
    #[cfg(unix)]
    original: Option<Termios>,
}

impl RawModeGuard {
    #[cfg(unix)]
    pub fn enable() -> Result<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a terminal, leaving its mode alone");
            return Ok(Self { original: None });
        }

        let original = tcgetattr(&stdin).map_err(std::io::Error::from)?;
        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(std::io::Error::from)?;

        Ok(Self {
            original: Some(original),
        })
    }

    #[cfg(not(unix))]
    pub fn enable() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            debug!("stdin is not a terminal, leaving its mode alone");
        }
        Ok(Self {})
    }

    pub fn is_active(&self) -> bool {
        #[cfg(unix)]
        {
            self.original.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(original) = self.original.take() {
            if let Err(e) = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &original) {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }
}
