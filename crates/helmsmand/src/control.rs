//! Operator control of a supervising process.
//!
//! redb locks the store file for the process that opened it, so while
//! `rollout`, `trigger` or `resume` supervises an episode a second
//! helmsmand cannot open the store to deliver `pause` or `terminate`.
//! The supervising process takes those requests as signals instead:
//! SIGUSR1 pauses the record it supervises, SIGUSR2 terminates it.

use tokio::sync::mpsc;
use tracing::{info, warn};

use helmsman_core::RecordKey;
use helmsman_rollout::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Terminate,
}

/// Forward operator signals as control requests.
///
/// On platforms without user signals the stream ends immediately.
pub fn listen() -> mpsc::Receiver<Control> {
    let (tx, rx) = mpsc::channel(4);
    #[cfg(unix)]
    forward_signals(tx);
    #[cfg(not(unix))]
    drop(tx);
    rx
}

#[cfg(unix)]
fn forward_signals(tx: mpsc::Sender<Control>) {
    use tokio::signal::unix::{signal, SignalKind};

    for (kind, control) in [
        (SignalKind::user_defined1(), Control::Pause),
        (SignalKind::user_defined2(), Control::Terminate),
    ] {
        let mut signals = match signal(kind) {
            Ok(signals) => signals,
            Err(e) => {
                warn!(?control, error = %e, "cannot install signal handler");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                if tx.send(control).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Apply control requests to `key` until the request stream ends.
pub async fn serve(engine: &Engine, key: &RecordKey, mut requests: mpsc::Receiver<Control>) {
    while let Some(control) = requests.recv().await {
        let outcome = match control {
            Control::Pause => engine.pause(key).await,
            Control::Terminate => engine.terminate(key).await,
        };
        match outcome {
            Ok(record) => info!(%key, ?control, state = %record.state, "control request applied"),
            Err(e) => warn!(%key, ?control, error = %e, "control request refused"),
        }
    }
}
