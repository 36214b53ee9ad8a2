//! Transport seam for control and data frames.
//!
//! The core never touches wire bytes: commands are serialized into frames
//! and handed to a [`CommandBus`], which owns delivery. The trait surface is
//! the bare minimum the runtimes need: declare an endpoint by name, publish
//! a frame (blocking or backpressure-surfacing), and consume an endpoint as
//! a stream of frames.
//!
//! The bundled [`InMemoryBus`] serves tests and single-process clusters. It
//! emulates a real bus faithfully: endpoints are bounded, consumers are
//! push-notified through a polled semaphore, and a full endpoint surfaces
//! backpressure to non-blocking publishers instead of dropping frames.

use std::{
    collections::VecDeque,
    pin::{pin, Pin},
    sync::Arc,
    task::{Context, Poll},
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::{
    lock::{Mutex, OwnedMutexLockFuture},
    ready, Future, Stream,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::PollSemaphore;

use crate::{error::NimbusError, ids::WorkerId};

/// Endpoint naming scheme shared by both runtimes.
pub fn controller_endpoint() -> String {
    "controller".to_string()
}

pub fn worker_endpoint(worker: WorkerId) -> String {
    format!("worker-{worker}")
}

pub fn data_endpoint(worker: WorkerId) -> String {
    format!("data-{worker}")
}

/// A factory of named frame endpoints.
#[async_trait]
pub trait CommandBus: Send + Sync + 'static {
    type Endpoint: BusEndpoint;

    /// Declare an endpoint. Declaration is idempotent: the same name yields
    /// handles onto the same underlying queue.
    async fn endpoint(&self, name: &str) -> Result<Self::Endpoint>;
}

/// One named frame queue.
#[async_trait]
pub trait BusEndpoint: Clone + Send + Sync + Unpin + 'static {
    /// Publish a frame, waiting for room if the endpoint is full.
    async fn publish(&self, frame: Bytes) -> Result<()>;

    /// Publish without waiting; a full endpoint surfaces backpressure.
    fn try_publish(&self, frame: Bytes) -> std::result::Result<(), NimbusError>;

    /// Consume the endpoint as a stream of frames.
    async fn stream(&self) -> Result<FrameStream>;
}

pub type FrameStream = Box<dyn Stream<Item = Bytes> + Send + Unpin>;

const DEFAULT_ENDPOINT_CAPACITY: usize = 1024;

/// An in-memory [`CommandBus`].
///
/// Cloning the bus is cheap; every clone resolves names against the same
/// endpoint registry, so a controller and several workers constructed from
/// clones see each other.
#[derive(Clone)]
pub struct InMemoryBus {
    endpoints: Arc<DashMap<String, InMemoryEndpoint>>,
    capacity: usize,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ENDPOINT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            capacity,
        }
    }
}

#[async_trait]
impl CommandBus for InMemoryBus {
    type Endpoint = InMemoryEndpoint;

    async fn endpoint(&self, name: &str) -> Result<Self::Endpoint> {
        match self.endpoints.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let endpoint = InMemoryEndpoint::new(name, self.capacity);
                entry.insert(endpoint.clone());
                Ok(endpoint)
            }
        }
    }
}

/// An in-memory endpoint: a bounded frame queue with push-notification.
///
/// Frames are raw bytes to keep the emulation honest; consumers deserialize
/// exactly as they would from a real transport.
#[derive(Clone)]
pub struct InMemoryEndpoint {
    name: String,
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    /// Counts queued frames; consumers acquire one permit per frame.
    num_frames: PollSemaphore,
    capacity: usize,
}

impl InMemoryEndpoint {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            frames: Arc::new(Mutex::new(VecDeque::new())),
            num_frames: PollSemaphore::new(Arc::new(Semaphore::new(0))),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl BusEndpoint for InMemoryEndpoint {
    async fn publish(&self, frame: Bytes) -> Result<()> {
        loop {
            {
                let mut frames = self.frames.lock().await;
                if frames.len() < self.capacity {
                    frames.push_back(frame);
                    self.num_frames.add_permits(1);
                    return Ok(());
                }
            }
            // Full; yield and retry rather than dropping.
            tokio::task::yield_now().await;
        }
    }

    fn try_publish(&self, frame: Bytes) -> std::result::Result<(), NimbusError> {
        let Some(mut frames) = self.frames.try_lock() else {
            return Err(NimbusError::Backpressure { worker: 0 });
        };
        if frames.len() >= self.capacity {
            return Err(NimbusError::Backpressure { worker: 0 });
        }
        frames.push_back(frame);
        self.num_frames.add_permits(1);
        Ok(())
    }

    async fn stream(&self) -> Result<FrameStream> {
        Ok(Box::new(EndpointStream {
            frames: self.frames.clone(),
            num_frames: self.num_frames.clone(),
            lock_fut: None,
        }))
    }
}

/// A [`Stream`] over an endpoint's frames.
///
/// Polling acquires a permit from the frame-count semaphore, which returns
/// pending while the queue is empty; this emulates a push. With a permit in
/// hand the stream locks the queue, pops one frame, and forgets the permit,
/// keeping permits and frames in one-to-one correspondence.
struct EndpointStream {
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    num_frames: PollSemaphore,
    lock_fut: Option<(OwnedMutexLockFuture<VecDeque<Bytes>>, OwnedSemaphorePermit)>,
}

impl Stream for EndpointStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();

        match this.lock_fut.take() {
            Some((mut fut, permit)) => match pin!(&mut fut).poll(cx) {
                Poll::Ready(mut queue) => {
                    let frame = queue.pop_front();
                    permit.forget();
                    drop(queue);
                    match frame {
                        Some(frame) => Poll::Ready(Some(frame)),
                        // Permits correspond 1:1 to frames.
                        None => unreachable!("permit acquired but endpoint was empty"),
                    }
                }
                Poll::Pending => {
                    this.lock_fut = Some((fut, permit));
                    Poll::Pending
                }
            },
            None => {
                let permit = ready!(this.num_frames.poll_acquire(cx));
                match permit {
                    Some(permit) => {
                        this.lock_fut = Some((this.frames.clone().lock_owned(), permit));
                        self.poll_next(cx)
                    }
                    None => Poll::Pending,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::{join, task::JoinHandle};

    use super::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 8])
    }

    async fn with_timeout<O, F: Future<Output = O>>(fut: F) -> Option<O> {
        tokio::select! {
            result = fut => Some(result),
            _ = tokio::time::sleep(Duration::from_millis(20)) => None,
        }
    }

    fn consume_next(endpoint: InMemoryEndpoint) -> JoinHandle<Bytes> {
        tokio::spawn(async move {
            let mut stream = endpoint.stream().await.unwrap();
            stream.next().await.unwrap()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn endpoint_names_resolve_to_the_same_queue() {
        let bus = InMemoryBus::new();
        let a = bus.endpoint("controller").await.unwrap();
        let b = bus.clone().endpoint("controller").await.unwrap();
        a.publish(frame(1)).await.unwrap();
        let received = with_timeout(consume_next(b)).await.unwrap().unwrap();
        assert_eq!(received, frame(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn frames_deliver_exactly_once() {
        let bus = InMemoryBus::new();
        let endpoint = bus.endpoint("worker-1").await.unwrap();
        endpoint.publish(frame(1)).await.unwrap();

        let (c1, c2) = (consume_next(endpoint.clone()), consume_next(endpoint));
        let (r1, r2) = join!(with_timeout(c1), with_timeout(c2));
        let delivered: Vec<_> = [r1, r2].into_iter().flatten().collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].as_ref().unwrap(), &frame(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consumer_blocks_until_publish() {
        let bus = InMemoryBus::new();
        let endpoint = bus.endpoint("worker-1").await.unwrap();
        let consumer = consume_next(endpoint.clone());

        tokio::time::sleep(Duration::from_millis(5)).await;
        endpoint.publish(frame(2)).await.unwrap();
        let received = with_timeout(consumer).await.unwrap().unwrap();
        assert_eq!(received, frame(2));
    }

    #[tokio::test]
    async fn full_endpoint_surfaces_backpressure() {
        let bus = InMemoryBus::with_capacity(2);
        let endpoint = bus.endpoint("worker-1").await.unwrap();
        endpoint.try_publish(frame(1)).unwrap();
        endpoint.try_publish(frame(2)).unwrap();
        let err = endpoint.try_publish(frame(3)).unwrap_err();
        assert!(matches!(err, NimbusError::Backpressure { .. }));

        // Draining one frame makes room again.
        let mut stream = endpoint.stream().await.unwrap();
        stream.next().await.unwrap();
        endpoint.try_publish(frame(3)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn frames_preserve_publish_order() {
        let bus = InMemoryBus::new();
        let endpoint = bus.endpoint("worker-1").await.unwrap();
        for tag in 0..8 {
            endpoint.publish(frame(tag)).await.unwrap();
        }
        let mut stream = endpoint.stream().await.unwrap();
        for tag in 0..8 {
            assert_eq!(stream.next().await.unwrap(), frame(tag));
        }
    }
}
