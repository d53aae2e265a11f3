use std::sync::atomic::{AtomicI32, Ordering};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::debug;

/// First termination signal delivered to this process, 0 while none has.
static FIRED: AtomicI32 = AtomicI32::new(0);

/// Signals that request a clean shutdown, mirroring the classic batch-job
/// set: hangup, interrupt, quit, terminate and the CPU rlimit notice.
fn termination_kinds() -> [(SignalKind, &'static str); 5] {
    [
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::quit(), "SIGQUIT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::from_raw(libc::SIGXCPU), "SIGXCPU"),
    ]
}

/// Install listeners that record the signal, flip `tx` to `true` and do
/// nothing else.
///
/// All cleanup runs in the normal control flow of whoever holds the
/// matching receiver; the signal context itself never touches the store
/// or the filesystem. Once that cleanup is done, [`chain`] re-delivers
/// the recorded signal so the process still dies by it.
pub fn listen(tx: watch::Sender<bool>) -> std::io::Result<()> {
    // A signal recorded between a stop and this restart belongs to no
    // live supervision; it must not be chained by the next shutdown.
    FIRED.store(0, Ordering::SeqCst);
    for (kind, name) in termination_kinds() {
        let mut stream = signal(kind)?;
        let raw = kind.as_raw_value();
        let tx = tx.clone();
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                debug!(signal = name, "termination signal received");
                record(raw);
                let _ = tx.send(true);
            }
        });
    }
    Ok(())
}

/// Remember the first signal; later ones are redundant shutdown requests.
fn record(sig: libc::c_int) {
    let _ = FIRED.compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
}

/// Re-deliver the recorded signal with its disposition restored to the
/// default; the process then terminates as if the signal had never been
/// caught. Does nothing when shutdown was not signal-driven.
///
/// Call only after cleanup is complete: when a signal was recorded this
/// function does not return.
pub fn chain() {
    let sig = FIRED.load(Ordering::SeqCst);
    if sig == 0 {
        return;
    }
    // Safety: plain libc calls from normal control flow, not from a
    // handler context. SIG_DFL replaces the listener registration.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The chain path kills its process, so these run it in a forked
    // child and assert on the wait status from the parent.

    #[test]
    fn chain_redelivers_the_first_recorded_signal() {
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed");
            if pid == 0 {
                record(libc::SIGTERM);
                record(libc::SIGINT);
                chain();
                // Reached only if chain failed to kill the child.
                libc::_exit(0);
            }
            let mut status = 0;
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
            assert!(libc::WIFSIGNALED(status), "status: {status}");
            assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);
        }
    }

    #[test]
    fn chain_is_inert_without_a_recorded_signal() {
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed");
            if pid == 0 {
                chain();
                libc::_exit(7);
            }
            let mut status = 0;
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
            assert!(libc::WIFEXITED(status), "status: {status}");
            assert_eq!(libc::WEXITSTATUS(status), 7);
        }
    }
}
