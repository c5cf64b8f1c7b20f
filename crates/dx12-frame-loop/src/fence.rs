//! CPU/GPU rendezvous built on a monotonically increasing fence value.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::CommandQueue;
use crate::backend::Device;
use crate::backend::Fence;
use crate::backend::FenceEvent;
use crate::backend::WaitStatus;
use crate::config::WaitPolicy;
use crate::context::GraphicsContext;
use crate::error::ResultCode;
use crate::error::SetupError;
use crate::error::SetupStage;
use crate::error::SyncError;

static NEXT_FENCE_ID: AtomicU32 = AtomicU32::new(0);

struct Bound<B: Backend> {
    queue: B::Queue,
    fence: B::Fence,
    event: B::Event,
}

/// Lets the CPU know when GPU work up to a given value has completed.
///
/// `signal` hands out strictly increasing values; `wait_cpu` blocks until the
/// GPU timeline reaches one of them.
pub struct FenceSynchronizer<B: Backend> {
    id: u32,
    bound: Option<Bound<B>>,
    value: AtomicU64,
    last_flush: AtomicU64,
    policy: WaitPolicy,
}

impl<B: Backend> FenceSynchronizer<B> {
    /// Creates the fence (at 0) and its event, bound to `queue`.
    pub fn setup(
        ctx: &GraphicsContext<B>,
        queue: &B::Queue,
        policy: WaitPolicy,
    ) -> Result<Self, SetupError> {
        let id = NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed);

        let fence = ctx.device.create_fence(0).map_err(|code| {
            error!(fence = id, %code, "Failed to create fence");
            SetupError::new(SetupStage::CreateFence, ResultCode::FenceCreationFailed, code)
        })?;

        let event = ctx.device.create_event().map_err(|code| {
            error!(fence = id, %code, "Failed to create fence event handle");
            SetupError::new(
                SetupStage::CreateEventHandle,
                ResultCode::EventHandleCreationFailed,
                code,
            )
        })?;

        debug!(fence = id, "Fence ready");
        Ok(Self {
            id,
            bound: Some(Bound {
                queue: queue.clone(),
                fence,
                event,
            }),
            value: AtomicU64::new(0),
            last_flush: AtomicU64::new(0),
            policy,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Last value handed out by [`FenceSynchronizer::signal`].
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    pub fn is_released(&self) -> bool {
        self.bound.is_none()
    }

    pub fn completed_value(&self) -> Result<u64, SyncError> {
        Ok(self.bound()?.fence.completed_value())
    }

    pub fn is_complete(&self, value: u64) -> Result<bool, SyncError> {
        Ok(self.completed_value()? >= value)
    }

    /// Increments the counter and asks the queue to write it once all prior
    /// work has finished. Returns the new value.
    pub fn signal(&self) -> Result<u64, SyncError> {
        let bound = self.bound()?;
        let value = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        bound.queue.signal(&bound.fence, value).map_err(|code| {
            error!(fence = self.id, value, %code, "Failed to signal fence");
            SyncError::SignalFailed { value, code }
        })?;
        trace!(fence = self.id, value, "Signaled");
        Ok(value)
    }

    /// Blocks until the GPU timeline reaches `value`.
    ///
    /// Returns at once without touching the event when `value` is already
    /// complete. Otherwise waits up to `policy.max_attempts` times for
    /// `policy.timeout` each.
    pub fn wait_cpu(&self, value: u64) -> Result<(), SyncError> {
        let bound = self.bound()?;
        if bound.fence.completed_value() >= value {
            return Ok(());
        }

        bound
            .fence
            .set_event_on_completion(value, &bound.event)
            .map_err(|code| {
                error!(fence = self.id, value, %code, "Failed to arm fence event");
                SyncError::ArmFailed { value, code }
            })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match bound.event.wait(self.policy.timeout) {
                WaitStatus::Signaled => {
                    trace!(fence = self.id, value, attempts, "Fence reached");
                    return Ok(());
                }
                WaitStatus::Failed(code) => {
                    error!(fence = self.id, value, %code, "Failed to wait for fence event");
                    return Err(SyncError::WaitFailed(code));
                }
                status => {
                    // the auto-reset event may have fired between arming and waiting
                    if bound.fence.completed_value() >= value {
                        return Ok(());
                    }
                    if attempts >= self.policy.max_attempts {
                        error!(
                            fence = self.id,
                            value,
                            attempts,
                            "Failed to wait for fence event. Timeout period elapsed."
                        );
                        return Err(SyncError::WaitTimedOut {
                            value,
                            attempts,
                            timeout: self.policy.timeout,
                        });
                    }
                    warn!(fence = self.id, value, attempts, ?status, "Fence wait woke early, retrying");
                }
            }
        }
    }

    /// Full CPU/GPU rendezvous: signal, then wait for that signal.
    ///
    /// Without a signal since the previous flush the rendezvous already
    /// holds, so nothing is enqueued and the counter is left alone.
    pub fn flush(&self) -> Result<u64, SyncError> {
        let current = self.value();
        if current != 0 && current == self.last_flush.load(Ordering::Acquire) {
            self.bound()?;
            return Ok(current);
        }
        self.rendezvous()
    }

    /// Signals and waits unconditionally. Use it when the queue may hold work
    /// submitted after the last signal.
    pub fn rendezvous(&self) -> Result<u64, SyncError> {
        let value = self.signal()?;
        self.wait_cpu(value)?;
        self.last_flush.store(value, Ordering::Release);
        debug!(fence = self.id, value, "Flushed");
        Ok(value)
    }

    /// Closes the event and drops the fence and queue reference. The counter
    /// returns to 0. Calling it again does nothing.
    pub fn release(&mut self) {
        let Some(bound) = self.bound.take() else {
            return;
        };
        let Bound {
            queue,
            fence,
            event,
        } = bound;
        drop(event);
        drop(fence);
        drop(queue);
        self.value.store(0, Ordering::Release);
        self.last_flush.store(0, Ordering::Release);
        info!(fence = self.id, "Fence released");
    }

    fn bound(&self) -> Result<&Bound<B>, SyncError> {
        self.bound.as_ref().ok_or(SyncError::Released)
    }
}

impl<B: Backend> Drop for FenceSynchronizer<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::NativeCode;
    use crate::headless::FailPoint;
    use crate::headless::GpuBehaviour;
    use crate::headless::Headless;
    use crate::headless::HeadlessGpu;

    fn fence_on(gpu: &HeadlessGpu) -> FenceSynchronizer<Headless> {
        let ctx = gpu.context();
        let queue = ctx.device.create_command_queue().unwrap();
        FenceSynchronizer::setup(&ctx, &queue, WaitPolicy::default()).unwrap()
    }

    #[test]
    fn signal_increments_from_zero() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let fence = fence_on(&gpu);
        assert_eq!(fence.value(), 0);
        assert_eq!(fence.signal().unwrap(), 1);
        assert_eq!(fence.signal().unwrap(), 2);
        assert_eq!(fence.value(), 2);
        assert_eq!(gpu.stats().signals, 2);
    }

    #[test]
    fn completed_value_skips_the_event() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let fence = fence_on(&gpu);
        let value = fence.signal().unwrap();
        fence.wait_cpu(value).unwrap();
        let stats = gpu.stats();
        assert_eq!(stats.event_arms, 0);
        assert_eq!(stats.event_waits, 0);
    }

    #[test]
    fn pending_value_waits_on_the_event() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        let value = fence.signal().unwrap();
        assert!(!fence.is_complete(value).unwrap());
        fence.wait_cpu(value).unwrap();
        assert!(fence.is_complete(value).unwrap());
        assert_eq!(gpu.stats().event_waits, 1);
    }

    #[test]
    fn earlier_values_are_released_no_later_than_later_ones() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        let first = fence.signal().unwrap();
        let second = fence.signal().unwrap();

        fence.wait_cpu(second).unwrap();
        let waits = gpu.stats().event_waits;
        fence.wait_cpu(first).unwrap();
        assert_eq!(gpu.stats().event_waits, waits);
    }

    #[test]
    fn stalled_gpu_times_out_after_three_attempts() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Stalled);
        let fence = fence_on(&gpu);
        let value = fence.signal().unwrap();
        assert_eq!(
            fence.wait_cpu(value),
            Err(SyncError::WaitTimedOut {
                value,
                attempts: 3,
                timeout: Duration::from_millis(2000)
            })
        );
        assert_eq!(gpu.stats().event_waits, 3);
    }

    #[test]
    fn spurious_wakes_are_retried() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        gpu.script_wait(WaitStatus::Abandoned);
        gpu.script_wait(WaitStatus::TimedOut);
        let value = fence.signal().unwrap();
        fence.wait_cpu(value).unwrap();
        assert_eq!(gpu.stats().event_waits, 3);
    }

    #[test]
    fn wait_failure_is_fatal() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        gpu.script_wait(WaitStatus::Failed(NativeCode(6)));
        let value = fence.signal().unwrap();
        assert_eq!(fence.wait_cpu(value), Err(SyncError::WaitFailed(NativeCode(6))));
        assert_eq!(gpu.stats().event_waits, 1);
    }

    #[test]
    fn second_flush_leaves_the_counter_alone() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        assert_eq!(fence.flush().unwrap(), 1);
        assert_eq!(fence.flush().unwrap(), 1);
        assert_eq!(fence.value(), 1);
        assert_eq!(gpu.stats().signals, 1);

        fence.signal().unwrap();
        assert_eq!(fence.flush().unwrap(), 3);
    }

    #[test]
    fn rendezvous_signals_even_after_a_flush() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        assert_eq!(fence.flush().unwrap(), 1);
        assert_eq!(fence.rendezvous().unwrap(), 2);
        assert_eq!(fence.completed_value().unwrap(), 2);
        assert_eq!(gpu.stats().signals, 2);

        // the rendezvous counts as the latest flush
        assert_eq!(fence.flush().unwrap(), 2);
        assert_eq!(gpu.stats().signals, 2);
    }

    #[test]
    fn arming_failure_is_reported() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let fence = fence_on(&gpu);
        let value = fence.signal().unwrap();
        gpu.fail_next(FailPoint::ArmEvent, NativeCode(0x0E));
        assert_eq!(
            fence.wait_cpu(value),
            Err(SyncError::ArmFailed {
                value,
                code: NativeCode(0x0E)
            })
        );
        assert_eq!(gpu.stats().event_waits, 0);

        fence.wait_cpu(value).unwrap();
        assert!(fence.is_complete(value).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut fence = fence_on(&gpu);
        fence.signal().unwrap();
        fence.release();
        fence.release();
        drop(fence);

        let stats = gpu.stats();
        assert_eq!(stats.events_closed, 1);
        assert_eq!(gpu.released("fence"), 1);
    }

    #[test]
    fn release_resets_the_counter() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut fence = fence_on(&gpu);
        fence.signal().unwrap();
        fence.release();
        assert_eq!(fence.value(), 0);
        assert!(fence.is_released());
        assert_eq!(fence.signal(), Err(SyncError::Released));
        assert_eq!(fence.wait_cpu(1), Err(SyncError::Released));
    }

    #[test]
    fn setup_reports_the_failing_stage() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let queue = ctx.device.create_command_queue().unwrap();

        gpu.fail_next(FailPoint::CreateFence, NativeCode::FAIL);
        let err = FenceSynchronizer::setup(&ctx, &queue, WaitPolicy::default())
            .err()
            .unwrap();
        assert_eq!(err.stage, SetupStage::CreateFence);
        assert_eq!(err.status, ResultCode::FenceCreationFailed);

        gpu.fail_next(FailPoint::CreateEvent, NativeCode(8));
        let err = FenceSynchronizer::setup(&ctx, &queue, WaitPolicy::default())
            .err()
            .unwrap();
        assert_eq!(err.stage, SetupStage::CreateEventHandle);
        assert_eq!(err.status, ResultCode::EventHandleCreationFailed);
        assert_eq!(err.code, NativeCode(8));
    }
}
