//! Admission control for downloads and remote API calls

use async_trait::async_trait;
use rowpipe_common::{Result, SdkError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bounds the number of simultaneous in-flight downloads.
///
/// Every successful `wait` must be paired with exactly one `release`; use
/// [`GateSlot`] rather than calling these directly.
#[async_trait]
pub trait ConcurrencyGate: Send + Sync {
    /// Block until a slot is available. Fails with `SdkError::Cancelled`
    /// if the token fires first.
    async fn wait(&self, cancel: &CancellationToken) -> Result<()>;

    fn release(&self);
}

/// An acquired gate slot, released when dropped
#[must_use = "the slot is released as soon as it is dropped"]
pub struct GateSlot {
    gate: Arc<dyn ConcurrencyGate>,
}

impl GateSlot {
    pub async fn acquire(gate: Arc<dyn ConcurrencyGate>, cancel: &CancellationToken) -> Result<Self> {
        gate.wait(cancel).await?;
        Ok(Self { gate })
    }
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for GateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateSlot").finish_non_exhaustive()
    }
}

/// Fixed concurrency limit
#[derive(Debug)]
pub struct SemaphoreGate {
    semaphore: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SemaphoreGate {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SdkError::config("gate capacity must be at least 1"));
        }
        Ok(Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of slots held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConcurrencyGate for SemaphoreGate {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SdkError::Cancelled),
            permit = self.semaphore.acquire() => {
                let permit = permit.map_err(|_| SdkError::Cancelled)?;
                permit.forget();
                let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak.fetch_max(now, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.semaphore.add_permits(1);
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket rate limit with an optional concurrency cap
#[derive(Debug)]
pub struct TokenBucketGate {
    fill_rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    cap: Option<SemaphoreGate>,
}

impl TokenBucketGate {
    /// `fill_rate` tokens per second, holding at most `burst` tokens
    pub fn new(fill_rate: f64, burst: u32) -> Result<Self> {
        if fill_rate <= 0.0 || !fill_rate.is_finite() {
            return Err(SdkError::config("token bucket fill rate must be positive"));
        }
        if burst == 0 {
            return Err(SdkError::config("token bucket burst must be at least 1"));
        }
        Ok(Self {
            fill_rate,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                refilled_at: Instant::now(),
            }),
            cap: None,
        })
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Result<Self> {
        self.cap = Some(SemaphoreGate::new(max_concurrency)?);
        Ok(self)
    }

    /// Take a token, or report how long until one is available
    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.fill_rate).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.fill_rate))
        }
    }
}

#[async_trait]
impl ConcurrencyGate for TokenBucketGate {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.try_take() {
                Ok(()) => break,
                Err(delay) => {
                    trace!(delay_ms = delay.as_millis() as u64, "Rate limited, waiting for token");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        if let Some(cap) = &self.cap {
            cap.wait(cancel).await?;
        }
        Ok(())
    }

    fn release(&self) {
        if let Some(cap) = &self.cap {
            cap.release();
        }
    }
}
