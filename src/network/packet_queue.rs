use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

#[derive(Debug, Eq, PartialEq)]
pub enum Dequeued<T> {
    Item(T),
    TimedOut,
    /// The queue was closed. Items still queued at that point were discarded.
    Closed,
}

#[derive(Debug, Eq, PartialEq)]
pub enum EnqueueError {
    Closed,
    Full,
}

struct QueueState<T> {
    items: VecDeque<T>,
    is_open: bool,
}

/// A bounded FIFO queue that callers can wait on with a timeout. Closing it wakes every waiting
///  producer and consumer, so shutdown can not leave a worker blocked.
///
/// The queue starts out closed and is opened when the network session comes up.
pub struct BlockingQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    item_available: Notify,
    space_available: Notify,
}

impl <T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> BlockingQueue<T> {
        BlockingQueue {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                is_open: false,
            }),
            item_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().is_open = true;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().is_open
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.is_open = false;
            if !state.items.is_empty() {
                trace!("discarding {} queued items on close", state.items.len());
            }
            state.items.clear();
        }
        self.item_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub async fn enqueue(&self, item: T, max_wait: Duration) -> Result<(), EnqueueError> {
        let deadline = Instant::now() + max_wait;

        loop {
            let space_available = self.space_available.notified();
            tokio::pin!(space_available);
            space_available.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if !state.is_open {
                    return Err(EnqueueError::Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.item_available.notify_one();
                    return Ok(());
                }
            }

            if timeout_at(deadline, space_available).await.is_err() {
                return Err(EnqueueError::Full);
            }
        }
    }

    pub async fn dequeue(&self, max_wait: Duration) -> Dequeued<T> {
        let deadline = Instant::now() + max_wait;

        loop {
            let item_available = self.item_available.notified();
            tokio::pin!(item_available);
            item_available.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if !state.is_open {
                    return Dequeued::Closed;
                }
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_available.notify_one();
                    return Dequeued::Item(item);
                }
            }

            if timeout_at(deadline, item_available).await.is_err() {
                return Dequeued::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rstest::rstest;
    use tokio::runtime::Builder;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_fifo_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = BlockingQueue::new(10);
            queue.open();
            for i in 0..5 {
                queue.enqueue(i, WAIT).await.unwrap();
            }
            for i in 0..5 {
                assert_eq!(queue.dequeue(WAIT).await, Dequeued::Item(i));
            }
            assert_eq!(queue.dequeue(WAIT).await, Dequeued::TimedOut);
        });
    }

    #[test]
    fn test_starts_closed() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = BlockingQueue::new(10);
            assert_eq!(queue.enqueue(1, WAIT).await, Err(EnqueueError::Closed));
            assert_eq!(queue.dequeue(WAIT).await, Dequeued::Closed);
        });
    }

    #[test]
    fn test_full_queue_times_out() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = BlockingQueue::new(2);
            queue.open();
            queue.enqueue(1, WAIT).await.unwrap();
            queue.enqueue(2, WAIT).await.unwrap();
            assert_eq!(queue.enqueue(3, WAIT).await, Err(EnqueueError::Full));
            assert_eq!(queue.len(), 2);
        });
    }

    #[test]
    fn test_blocked_producer_resumes_when_space_frees_up() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(BlockingQueue::new(1));
            queue.open();
            queue.enqueue(1, WAIT).await.unwrap();

            let producer = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue(2, Duration::from_secs(5)).await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;

            assert_eq!(queue.dequeue(WAIT).await, Dequeued::Item(1));
            assert_eq!(producer.await.unwrap(), Ok(()));
            assert_eq!(queue.dequeue(WAIT).await, Dequeued::Item(2));
        });
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::several(5)]
    fn test_close_unblocks_waiting_consumers(#[case] num_queued: usize) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(BlockingQueue::new(10));
            queue.open();

            let consumers = (0..2)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        let mut num_received = 0;
                        loop {
                            match queue.dequeue(Duration::from_secs(3600)).await {
                                Dequeued::Item(_) => num_received += 1,
                                Dequeued::TimedOut => panic!("consumer should not time out"),
                                Dequeued::Closed => return num_received,
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            for i in 0..num_queued {
                queue.enqueue(i, WAIT).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            let closed_at = Instant::now();
            queue.close();

            let mut total = 0;
            for consumer in consumers {
                total += consumer.await.unwrap();
            }
            assert_eq!(total, num_queued);
            assert!(closed_at.elapsed() < WAIT);
            assert!(!queue.is_open());
        });
    }

    #[test]
    fn test_reopen_after_close() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = BlockingQueue::new(10);
            queue.open();
            queue.enqueue(1, WAIT).await.unwrap();
            queue.close();
            queue.open();
            assert_eq!(queue.len(), 0);
            queue.enqueue(2, WAIT).await.unwrap();
            assert_eq!(queue.dequeue(WAIT).await, Dequeued::Item(2));
        });
    }
}
