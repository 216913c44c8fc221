//! Fan-in of per-source output queues
//!
//! One relay task per input forwards items into a shared bounded channel.
//! Each relay owns a clone of the output sender, so the merged receiver only
//! reports closure after every relay has exited.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Merges several receivers into one
///
/// Items from the same input keep their order; interleaving across inputs is
/// unspecified. On cancellation each relay closes its input so producers stop
/// promptly, then discards whatever was already buffered.
///
/// # Arguments
///
/// * `inputs` - Per-source receivers
/// * `capacity` - Bound of the merged channel
/// * `cancel` - Stops forwarding when cancelled
pub fn merge<T: Send + 'static>(
    inputs: Vec<mpsc::Receiver<T>>,
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    for input in inputs {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(relay(input, tx, cancel));
    }

    rx
}

async fn relay<T>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<T>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = input.recv() => item,
        };

        let Some(item) = item else {
            return;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = output.send(item) => {
                if sent.is_err() {
                    // Downstream is gone
                    break;
                }
            }
        }
    }

    input.close();
    while input.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn spawn_producer(
        source: usize,
        count: usize,
        capacity: usize,
    ) -> mpsc::Receiver<(usize, usize)> {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            for i in 0..count {
                if tx.send((source, i)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_merge_yields_every_item() {
        let sources = 8;
        let per_source = 250;
        let inputs = (0..sources)
            .map(|s| spawn_producer(s, per_source, 4))
            .collect();

        let mut merged = merge(inputs, 3, CancellationToken::new());

        let mut last_seen: HashMap<usize, usize> = HashMap::new();
        let mut total = 0;
        while let Some((source, i)) = merged.recv().await {
            // Per-source order is preserved
            if let Some(prev) = last_seen.insert(source, i) {
                assert!(i > prev);
            }
            total += 1;
        }

        assert_eq!(total, sources * per_source);
    }

    #[tokio::test]
    async fn test_merge_stays_open_while_any_input_is_open() {
        let (early_tx, early_rx) = mpsc::channel::<u32>(1);
        let (late_tx, late_rx) = mpsc::channel::<u32>(1);

        let mut merged = merge(vec![early_rx, late_rx], 1, CancellationToken::new());

        early_tx.send(1).await.unwrap();
        drop(early_tx);
        assert_eq!(merged.recv().await, Some(1));

        // One input is still open, so the merged channel must not close
        let pending = tokio::time::timeout(Duration::from_millis(50), merged.recv()).await;
        assert!(pending.is_err());

        late_tx.send(2).await.unwrap();
        drop(late_tx);
        assert_eq!(merged.recv().await, Some(2));
        assert_eq!(merged.recv().await, None);
    }

    #[tokio::test]
    async fn test_merge_with_no_inputs_closes_immediately() {
        let mut merged = merge::<u8>(Vec::new(), 1, CancellationToken::new());
        assert_eq!(merged.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_closes_inputs() {
        let (tx, rx) = mpsc::channel::<u32>(2);
        let cancel = CancellationToken::new();
        let mut merged = merge(vec![rx], 1, cancel.clone());

        tx.send(1).await.unwrap();
        cancel.cancel();

        // Producers see the input closed instead of blocking forever
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
        assert!(tx.send(2).await.is_err());

        // The merged stream ends once the relay exits
        while merged.recv().await.is_some() {}
    }
}
