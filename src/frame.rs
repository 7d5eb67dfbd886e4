// =============================================================================
// FRAME LOOP - per-frame synchronization state machine
// =============================================================================
//
// Each frame slot cycles through:
//
//   Idle (fence signaled) -> Acquiring -> Recording -> Submitted -> Presented
//
// The loop only decides *what* happens in which order; the Vulkan calls live
// behind `FrameBackend` (implemented by the renderer).
//
// FRAME FLOW:
// 1. Wait for this slot's fence (caps CPU run-ahead at F frames)
// 2. Acquire swapchain image (out of date -> recreate, skip frame)
// 3. Write this slot's uniform buffer
// 4. Reset fence + command buffer, record, submit
// 5. Present (stale, suboptimal or resized -> recreate AFTER presenting)
// 6. Advance current_frame = (current_frame + 1) % F
//
// =============================================================================

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The chain no longer matches the surface and must be rebuilt
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented (or dropped), but the chain is out of date or suboptimal
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Recreated,
    /// Framebuffer is zero-sized (minimized); nothing was created
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was submitted and presented
    Presented,
    /// The swapchain was stale on acquire; it was rebuilt and nothing was submitted
    Skipped,
    /// Waiting for a usable framebuffer size before the chain can be rebuilt
    Suspended,
}

/// GPU-side operations the frame loop drives, one frame slot at a time.
pub trait FrameBackend {
    /// Block until the slot's previous submission has finished.
    fn wait_for_frame(&mut self, slot: usize) -> Result<()>;
    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn update_uniforms(&mut self, slot: usize) -> Result<()>;
    /// Reset the slot's fence and command buffer, record the draw and submit it.
    fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    /// Wait for the device to go idle and rebuild the swapchain.
    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome>;
}

/// "Framebuffer resized" flag.
///
/// Raised by the window event handler, taken once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal(Arc<AtomicBool>);

impl ResizeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether the flag was raised and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct FrameLoop {
    frames_in_flight: usize,
    /// Which sync slot we're currently using (0 to frames_in_flight-1)
    current_frame: usize,
    /// Set when a recreation had to be deferred (zero-sized framebuffer)
    recreate_pending: bool,
    resize: ResizeSignal,
}

impl FrameLoop {
    pub fn new(frames_in_flight: usize, resize: ResizeSignal) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_frame: 0,
            recreate_pending: false,
            resize,
        }
    }

    #[cfg(test)]
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[cfg(test)]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn is_suspended(&self) -> bool {
        self.recreate_pending
    }

    /// Force a swapchain rebuild before the next frame.
    pub fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    /// Run one iteration of the render loop.
    pub fn draw_frame<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<FrameStatus> {
        if self.recreate_pending && !self.recreate(backend)? {
            return Ok(FrameStatus::Suspended);
        }

        let slot = self.current_frame;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until the GPU is done with this slot
        // ─────────────────────────────────────────────────────────────────────
        backend.wait_for_frame(slot)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        // The fence is still signaled here, so bailing out leaves the slot idle.
        let (image_index, mut stale) = match backend.acquire_next_image(slot)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, recreating");
                return Ok(if self.recreate(backend)? {
                    FrameStatus::Skipped
                } else {
                    FrameStatus::Suspended
                });
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3-4: Update uniforms, record, submit
        // ─────────────────────────────────────────────────────────────────────
        backend.update_uniforms(slot)?;
        backend.record_and_submit(slot, image_index)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present, then rebuild if anything went stale
        // ─────────────────────────────────────────────────────────────────────
        // The acquired image must be presented even when the chain is stale.
        stale |= backend.present(slot, image_index)? == PresentOutcome::Stale;
        let resized = self.resize.take();
        if stale || resized {
            log::debug!("Recreating swapchain after present (stale: {}, resized: {})", stale, resized);
            self.recreate(backend)?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Advance to next frame
        // ─────────────────────────────────────────────────────────────────────
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;

        Ok(FrameStatus::Presented)
    }

    /// Returns true if the chain was rebuilt, false if it had to be deferred.
    fn recreate<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<bool> {
        self.resize.take();
        match backend.recreate_swapchain()? {
            RecreateOutcome::Recreated => {
                self.recreate_pending = false;
                Ok(true)
            }
            RecreateOutcome::Deferred => {
                self.recreate_pending = true;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Update(usize),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate,
    }

    /// Scripted backend that models fences as "unsignaled until waited on".
    struct MockBackend {
        calls: Vec<Call>,
        acquire_script: VecDeque<Result<AcquireOutcome, &'static str>>,
        present_script: VecDeque<PresentOutcome>,
        image_count: u32,
        next_image: u32,
        visible: bool,
        swapchains_created: usize,
        fence_unsignaled: Vec<bool>,
        max_in_flight: usize,
    }

    impl MockBackend {
        fn new(frames_in_flight: usize) -> Self {
            Self {
                calls: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                image_count: 3,
                next_image: 0,
                visible: true,
                swapchains_created: 1,
                fence_unsignaled: vec![false; frames_in_flight],
                max_in_flight: 0,
            }
        }

        fn submissions(&self) -> usize {
            self.calls.iter().filter(|c| matches!(c, Call::Submit(..))).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            // Blocking wait returns once the GPU has signaled the fence
            self.fence_unsignaled[slot] = false;
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            match self.acquire_script.pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => {
                    let image_index = self.next_image;
                    self.next_image = (self.next_image + 1) % self.image_count;
                    Ok(AcquireOutcome::Acquired { image_index, suboptimal: false })
                }
            }
        }

        fn update_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Update(slot));
            Ok(())
        }

        fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert!(!self.fence_unsignaled[slot], "slot {slot} submitted while its fence is unsignaled");
            self.calls.push(Call::Submit(slot, image_index));
            self.fence_unsignaled[slot] = true;
            let outstanding = self.fence_unsignaled.iter().filter(|&&f| f).count();
            self.max_in_flight = self.max_in_flight.max(outstanding);
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
            if !self.visible {
                return Ok(RecreateOutcome::Deferred);
            }
            self.calls.push(Call::Recreate);
            self.swapchains_created += 1;
            Ok(RecreateOutcome::Recreated)
        }
    }

    #[test]
    fn current_frame_cycles_with_period_f() {
        for frames in 1..=4 {
            let mut backend = MockBackend::new(frames);
            let mut frame_loop = FrameLoop::new(frames, ResizeSignal::new());
            let start = frame_loop.current_frame();

            for i in 1..=frames {
                assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
                if i < frames {
                    assert_ne!(frame_loop.current_frame(), start);
                }
            }
            assert_eq!(frame_loop.current_frame(), start);
        }
    }

    #[test]
    fn steady_state_follows_wait_acquire_update_submit_present() {
        let mut backend = MockBackend::new(2);
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        frame_loop.draw_frame(&mut backend).unwrap();
        frame_loop.draw_frame(&mut backend).unwrap();

        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Update(0),
                Call::Submit(0, 0),
                Call::Present(0, 0),
                Call::Wait(1),
                Call::Acquire(1),
                Call::Update(1),
                Call::Submit(1, 1),
                Call::Present(1, 1),
            ]
        );
    }

    #[test]
    fn slot_index_is_independent_of_image_index() {
        let mut backend = MockBackend::new(2);
        backend.acquire_script.push_back(Ok(AcquireOutcome::Acquired { image_index: 2, suboptimal: false }));
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        frame_loop.draw_frame(&mut backend).unwrap();
        assert!(backend.calls.contains(&Call::Submit(0, 2)));
        assert_eq!(frame_loop.current_frame(), 1);
    }

    #[test]
    fn never_more_than_f_frames_in_flight() {
        let frames = 2;
        let mut backend = MockBackend::new(frames);
        let mut frame_loop = FrameLoop::new(frames, ResizeSignal::new());

        for _ in 0..10 {
            frame_loop.draw_frame(&mut backend).unwrap();
        }

        assert_eq!(backend.max_in_flight, frames);
        assert_eq!(backend.submissions(), 10);

        // Frame k+F waits on the fence frame k signaled before submitting.
        let submits: Vec<usize> = backend
            .calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| matches!(c, Call::Submit(..)).then_some(i))
            .collect();
        for k in 0..submits.len() - frames {
            let Call::Submit(slot, _) = backend.calls[submits[k]] else { unreachable!() };
            let waited = backend.calls[submits[k]..submits[k + frames]].contains(&Call::Wait(slot));
            assert!(waited, "frame {} did not wait on slot {}", k + frames, slot);
        }
    }

    #[test]
    fn out_of_date_on_acquire_skips_submission_and_recreates_first() {
        let mut backend = MockBackend::new(2);
        backend.acquire_script.push_back(Ok(AcquireOutcome::OutOfDate));
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Skipped);
        assert_eq!(backend.submissions(), 0);
        assert_eq!(backend.calls, vec![Call::Wait(0), Call::Acquire(0), Call::Recreate]);
        // The slot was never used, so the counter does not advance
        assert_eq!(frame_loop.current_frame(), 0);

        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        let recreate = backend.calls.iter().position(|c| *c == Call::Recreate).unwrap();
        let next_acquire = backend.calls.iter().rposition(|c| matches!(c, Call::Acquire(_))).unwrap();
        assert!(recreate < next_acquire);
    }

    #[test]
    fn suboptimal_acquire_presents_then_recreates() {
        let mut backend = MockBackend::new(2);
        backend.acquire_script.push_back(Ok(AcquireOutcome::Acquired { image_index: 0, suboptimal: true }));
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(
            &backend.calls[3..],
            &[Call::Submit(0, 0), Call::Present(0, 0), Call::Recreate]
        );
    }

    #[test]
    fn stale_present_recreates_after_presenting() {
        let mut backend = MockBackend::new(2);
        backend.present_script.push_back(PresentOutcome::Stale);
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        frame_loop.draw_frame(&mut backend).unwrap();
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
        assert_eq!(frame_loop.current_frame(), 1);
    }

    #[test]
    fn resize_flag_is_consumed_once() {
        let resize = ResizeSignal::new();
        let mut backend = MockBackend::new(2);
        let mut frame_loop = FrameLoop::new(2, resize.clone());

        resize.raise();
        frame_loop.draw_frame(&mut backend).unwrap();
        assert!(!resize.is_raised());
        assert_eq!(backend.swapchains_created, 2);

        frame_loop.draw_frame(&mut backend).unwrap();
        assert_eq!(backend.swapchains_created, 2);
    }

    #[test]
    fn zero_sized_framebuffer_suspends_until_visible() {
        let mut backend = MockBackend::new(2);
        backend.visible = false;
        backend.acquire_script.push_back(Ok(AcquireOutcome::OutOfDate));
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Suspended);
        assert!(frame_loop.is_suspended());

        // Still minimized: nothing touches the slots or the swapchain
        let calls_before = backend.calls.len();
        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Suspended);
        assert_eq!(backend.calls.len(), calls_before);
        assert_eq!(backend.swapchains_created, 1);

        backend.visible = true;
        assert_eq!(frame_loop.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.calls[calls_before], Call::Recreate);
        assert!(!frame_loop.is_suspended());
    }

    #[test]
    fn requested_recreate_runs_before_next_frame() {
        let mut backend = MockBackend::new(2);
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());
        frame_loop.request_recreate();

        frame_loop.draw_frame(&mut backend).unwrap();
        assert_eq!(backend.calls.first(), Some(&Call::Recreate));
    }

    #[test]
    fn acquire_failure_is_fatal_and_nothing_is_submitted() {
        let mut backend = MockBackend::new(2);
        backend.acquire_script.push_back(Err("device lost"));
        let mut frame_loop = FrameLoop::new(2, ResizeSignal::new());

        let err = frame_loop.draw_frame(&mut backend).unwrap_err();
        assert!(err.to_string().contains("device lost"));
        assert_eq!(backend.submissions(), 0);
    }

    #[test]
    fn zero_frames_in_flight_is_treated_as_one() {
        let frame_loop = FrameLoop::new(0, ResizeSignal::new());
        assert_eq!(frame_loop.frames_in_flight(), 1);
    }
}
