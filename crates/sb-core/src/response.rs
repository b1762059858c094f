//! Per-channel response queues
//!
//! Each channel has one queue that outlives its worker. Workers only enqueue
//! while an expect is listening; a listener holds the queue's receiver
//! through a [`ResponseLease`], so every line is consumed by at most one
//! expect.
//!
//! Publishing never waits. A worker must stay free to serve `Close` and
//! `Reopen` even while the lease holder is busy doing something else, so
//! once `capacity` lines are waiting, further lines are dropped from the
//! queue (they still reach the log). Interruptions are always delivered.
//!
//! Acquiring a lease flushes stale lines before enabling the queue, and
//! dropping it disables the queue and flushes again.

use std::future::poll_fn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;

use sb_protocol::{InterruptReason, LineKind};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::config::OverlapPolicy;
use crate::error::SwitchboardError;

/// What a worker hands to a listening expect
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseItem {
    /// A framed line and its classification
    Line { text: String, kind: LineKind },
    /// The channel stopped delivering output
    Interrupted(InterruptReason),
}

/// What happened to a published item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Published {
    /// Nobody is listening
    Idle,
    /// Queued for the listener
    Queued,
    /// The listener is `capacity` lines behind; the line was dropped
    Overflow,
}

#[derive(Debug)]
struct Shared {
    listeners: AtomicUsize,
    depth: AtomicUsize,
    capacity: usize,
}

/// Worker side of a response queue
#[derive(Debug, Clone)]
pub(crate) struct ResponseSink {
    tx: mpsc::UnboundedSender<ResponseItem>,
    shared: Arc<Shared>,
}

impl ResponseSink {
    /// Enqueue `item` if anyone is listening
    pub(crate) fn publish(&self, item: ResponseItem) -> Published {
        let shared = &self.shared;
        if shared.listeners.load(Ordering::SeqCst) == 0 {
            return Published::Idle;
        }
        if matches!(item, ResponseItem::Line { .. })
            && shared.depth.load(Ordering::SeqCst) >= shared.capacity
        {
            return Published::Overflow;
        }
        shared.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            shared.depth.fetch_sub(1, Ordering::SeqCst);
        }
        Published::Queued
    }
}

/// One channel's response queue
#[derive(Debug)]
pub(crate) struct ResponseQueue {
    index: usize,
    tx: mpsc::UnboundedSender<ResponseItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<ResponseItem>>>,
    shared: Arc<Shared>,
}

impl ResponseQueue {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            index,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            shared: Arc::new(Shared {
                listeners: AtomicUsize::new(0),
                depth: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    pub(crate) fn sink(&self) -> ResponseSink {
        ResponseSink {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    #[cfg(test)]
    fn listeners(&self) -> usize {
        self.shared.listeners.load(Ordering::SeqCst)
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ResponseItem>, shared: &Shared) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        shared.depth.fetch_sub(1, Ordering::SeqCst);
        dropped += 1;
    }
    dropped
}

struct Held {
    index: usize,
    rx: OwnedMutexGuard<mpsc::UnboundedReceiver<ResponseItem>>,
    shared: Arc<Shared>,
}

/// Exclusive, enabled access to a set of response queues
pub(crate) struct ResponseLease {
    held: Vec<Held>,
}

impl ResponseLease {
    /// Take the receivers for `channels` (ascending), flush and enable them
    pub(crate) async fn acquire(
        queues: &[ResponseQueue],
        channels: &[usize],
        policy: OverlapPolicy,
    ) -> Result<Self, SwitchboardError> {
        let mut guards = Vec::with_capacity(channels.len());
        for &index in channels {
            let queue = queues.get(index).ok_or(SwitchboardError::NoSuchChannel {
                index,
                count: queues.len(),
            })?;
            let guard = match policy {
                OverlapPolicy::Wait => queue.rx.clone().lock_owned().await,
                OverlapPolicy::Reject => queue
                    .rx
                    .clone()
                    .try_lock_owned()
                    .map_err(|_| SwitchboardError::ChannelBusy(index))?,
            };
            guards.push((queue, guard));
        }

        let held = guards
            .into_iter()
            .map(|(queue, mut rx)| {
                let stale = drain(&mut rx, &queue.shared);
                if stale > 0 {
                    trace!("Flushed {} stale line(s) from channel {}", stale, queue.index);
                }
                queue.shared.listeners.fetch_add(1, Ordering::SeqCst);
                Held {
                    index: queue.index,
                    rx,
                    shared: queue.shared.clone(),
                }
            })
            .collect();
        Ok(Self { held })
    }

    /// Next item from whichever held queue has one first
    ///
    /// Lower channel indices win when several are ready at once. Returns
    /// `None` only if every queue has been closed.
    pub(crate) async fn next(&mut self) -> Option<(usize, ResponseItem)> {
        poll_fn(|cx| {
            let mut open = false;
            for held in self.held.iter_mut() {
                match held.rx.poll_recv(cx) {
                    Poll::Ready(Some(item)) => {
                        held.shared.depth.fetch_sub(1, Ordering::SeqCst);
                        return Poll::Ready(Some((held.index, item)));
                    }
                    Poll::Ready(None) => {}
                    Poll::Pending => open = true,
                }
            }
            if open {
                Poll::Pending
            } else {
                Poll::Ready(None)
            }
        })
        .await
    }
}

impl Drop for ResponseLease {
    fn drop(&mut self) {
        for held in self.held.iter_mut() {
            held.shared.listeners.fetch_sub(1, Ordering::SeqCst);
            drain(&mut held.rx, &held.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> ResponseItem {
        ResponseItem::Line {
            text: text.to_string(),
            kind: LineKind::Response,
        }
    }

    #[tokio::test]
    async fn test_nothing_enqueued_without_listener() {
        let queues = vec![ResponseQueue::new(0, 8)];
        let sink = queues[0].sink();
        sink.publish(line("early\n"));

        let mut lease = ResponseLease::acquire(&queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        sink.publish(line("late\n"));
        assert_eq!(lease.next().await, Some((0, line("late\n"))));
    }

    #[tokio::test]
    async fn test_release_disables_and_flushes() {
        let queues = vec![ResponseQueue::new(0, 8)];
        let sink = queues[0].sink();
        let lease = ResponseLease::acquire(&queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        sink.publish(line("unread\n"));
        drop(lease);
        assert_eq!(queues[0].listeners(), 0);

        sink.publish(line("ignored\n"));
        let mut lease = ResponseLease::acquire(&queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        sink.publish(line("fresh\n"));
        assert_eq!(lease.next().await, Some((0, line("fresh\n"))));
    }

    #[tokio::test]
    async fn test_reject_policy_reports_busy() {
        let queues = vec![ResponseQueue::new(0, 8), ResponseQueue::new(1, 8)];
        let _first = ResponseLease::acquire(&queues, &[1], OverlapPolicy::Reject)
            .await
            .unwrap();
        let second = ResponseLease::acquire(&queues, &[0, 1], OverlapPolicy::Reject).await;
        assert!(matches!(second, Err(SwitchboardError::ChannelBusy(1))));
        // The failed attempt must not leave channel 0 enabled or locked
        assert_eq!(queues[0].listeners(), 0);
        assert!(ResponseLease::acquire(&queues, &[0], OverlapPolicy::Reject)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_next_merges_channels() {
        let queues = vec![ResponseQueue::new(0, 8), ResponseQueue::new(1, 8)];
        let mut lease = ResponseLease::acquire(&queues, &[0, 1], OverlapPolicy::Wait)
            .await
            .unwrap();
        queues[1].sink().publish(line("b\n"));
        queues[0]
            .sink()
            .publish(ResponseItem::Interrupted(InterruptReason::Closed));
        assert_eq!(
            lease.next().await,
            Some((0, ResponseItem::Interrupted(InterruptReason::Closed)))
        );
        assert_eq!(lease.next().await, Some((1, line("b\n"))));
    }

    #[tokio::test]
    async fn test_full_queue_drops_lines_but_not_interruptions() {
        let queues = vec![ResponseQueue::new(0, 2)];
        let sink = queues[0].sink();
        assert_eq!(sink.publish(line("idle\n")), Published::Idle);

        let mut lease = ResponseLease::acquire(&queues, &[0], OverlapPolicy::Wait)
            .await
            .unwrap();
        assert_eq!(sink.publish(line("a\n")), Published::Queued);
        assert_eq!(sink.publish(line("b\n")), Published::Queued);
        assert_eq!(sink.publish(line("c\n")), Published::Overflow);
        assert_eq!(
            sink.publish(ResponseItem::Interrupted(InterruptReason::Closed)),
            Published::Queued
        );

        assert_eq!(lease.next().await, Some((0, line("a\n"))));
        assert_eq!(sink.publish(line("d\n")), Published::Overflow);
        assert_eq!(lease.next().await, Some((0, line("b\n"))));
        assert_eq!(sink.publish(line("e\n")), Published::Queued);
        assert_eq!(
            lease.next().await,
            Some((0, ResponseItem::Interrupted(InterruptReason::Closed)))
        );
        assert_eq!(lease.next().await, Some((0, line("e\n"))));
    }

    #[test]
    fn test_unknown_channel() {
        let queues = vec![ResponseQueue::new(0, 8)];
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = rt.block_on(ResponseLease::acquire(&queues, &[3], OverlapPolicy::Wait));
        assert!(matches!(
            result,
            Err(SwitchboardError::NoSuchChannel { index: 3, count: 1 })
        ));
    }
}
