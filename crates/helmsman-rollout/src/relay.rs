//! Watch relay: forwards record change events to a push stream.

use tokio::sync::{mpsc, watch};
use tracing::debug;

use helmsman_state::{ChangeEvent, Subscription};

/// Buffered events per relay before the relay waits on its consumer.
pub(crate) const RELAY_CAPACITY: usize = 64;

/// Spawn a relay task feeding `subscription` into a bounded channel.
///
/// The task stops when the receiver is dropped, the store goes away, or
/// shutdown is signalled; the stream then ends.
pub(crate) fn spawn(
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<ChangeEvent> {
    let (tx, rx) = mpsc::channel(RELAY_CAPACITY);

    tokio::spawn(async move {
        if *shutdown.borrow_and_update() {
            return;
        }
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tx.closed() => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(filter = ?subscription.filter(), "watch relay stopped");
    });

    rx
}
