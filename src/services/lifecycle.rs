//! Signal hooks that close the token before the process goes away.
//!
//! Interrupt and terminate close the session right away, bypassing the idle
//! delay, then end the process with [`SIGNAL_EXIT_CODE`]. Hang-up is caught
//! and ignored so an unrelated terminal event cannot tear the session down.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::infra::error::{SessionError, SessionResult};
use crate::services::provider::SignatureProvider;

/// Exit status after a termination signal.
pub const SIGNAL_EXIT_CODE: i32 = 1;

/// How long shutdown may wait for an in-flight device call before the process
/// exits regardless.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static HOOKS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether signal hooks have been registered in this process.
#[must_use]
pub fn hooks_installed() -> bool {
    HOOKS_INSTALLED.load(Ordering::SeqCst)
}

/// Shut `provider` down and exit the process on interrupt or terminate.
pub fn install_for_provider(provider: &'static SignatureProvider) -> SessionResult<()> {
    install(move || provider.shutdown())
}

/// Run `shutdown` and exit the process on interrupt or terminate.
pub fn install<F>(shutdown: F) -> SessionResult<()>
where
    F: FnOnce() + Send + 'static,
{
    install_with_exit(shutdown, |code| std::process::exit(code))
}

/// Like [`install`], with the final exit step supplied by the caller.
///
/// Returns once the handlers are registered. Registration failures are
/// reported here rather than on the signal thread.
pub fn install_with_exit<F, E>(shutdown: F, exit: E) -> SessionResult<()>
where
    F: FnOnce() + Send + 'static,
    E: FnOnce(i32) + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();

    thread::Builder::new()
        .name("tkey-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let Some(signal) = runtime.block_on(wait_for_termination(ready_tx)) else {
                return;
            };
            log::info!("Received {signal}, closing TKey connection");
            run_with_grace(shutdown, SHUTDOWN_GRACE);
            exit(SIGNAL_EXIT_CODE);
        })
        .map_err(|e| SessionError::Configuration(format!("could not start signal thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            HOOKS_INSTALLED.store(true, Ordering::SeqCst);
            Ok(())
        }
        Ok(Err(e)) => Err(SessionError::Configuration(format!(
            "could not install signal handlers: {e}"
        ))),
        Err(_) => Err(SessionError::Configuration(
            "signal thread exited during setup".to_string(),
        )),
    }
}

#[cfg(unix)]
async fn wait_for_termination(ready: mpsc::Sender<io::Result<()>>) -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (|| {
        Ok::<_, io::Error>((
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        ))
    })();
    let (mut sigint, mut sigterm, mut sighup) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            let _ = ready.send(Err(e));
            return None;
        }
    };
    let _ = ready.send(Ok(()));

    loop {
        tokio::select! {
            _ = sighup.recv() => log::debug!("Ignoring SIGHUP"),
            _ = sigint.recv() => return Some("SIGINT"),
            _ = sigterm.recv() => return Some("SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination(ready: mpsc::Sender<io::Result<()>>) -> Option<&'static str> {
    let _ = ready.send(Ok(()));
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("Ctrl+C"),
        Err(e) => {
            log::warn!("Failed to listen for Ctrl+C: {e}");
            None
        }
    }
}

/// Run `shutdown` on its own thread, giving up on it after `grace`.
fn run_with_grace<F>(shutdown: F, grace: Duration)
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let spawned = thread::Builder::new()
        .name("tkey-shutdown".to_string())
        .spawn(move || {
            shutdown();
            let _ = done_tx.send(());
        });

    match spawned {
        Ok(_) => {
            if done_rx.recv_timeout(grace).is_err() {
                log::warn!("TKey did not close within {grace:?}, exiting anyway");
            }
        }
        Err(e) => log::warn!("Could not run shutdown: {e}"),
    }
}
