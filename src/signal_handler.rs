use std::thread::{self, JoinHandle};

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::{Handle, Signals},
};
use tracing::{info, warn};

use crate::error::Result;
use crate::util::command::CancelToken;

/// While alive, SIGINT and SIGTERM cancel the running task instead of
/// killing the process, so the task gets to clean up after itself.
pub struct SignalWatch {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatch {
    pub fn cancel_on_signal(token: CancelToken) -> Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if token.is_cancelled() {
                        warn!("signal {} received; still cleaning up", signal);
                    } else {
                        info!("signal {} received; cancelling", signal);
                        token.cancel();
                    }
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn sigterm_cancels_the_token() {
        let token = CancelToken::new();
        let watch = SignalWatch::cancel_on_signal(token.clone()).expect("watch");
        signal_hook::low_level::raise(SIGTERM).expect("raise");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(token.is_cancelled());
        drop(watch);
    }
}
