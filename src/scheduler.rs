use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::*;

/// Result of asking the swapchain for the next image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready(u32),
    Suboptimal(u32),
    OutOfDate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecreateOutcome {
    Recreated,
    /// The framebuffer has no area; try again on a later frame.
    Deferred,
}

/// GPU-side steps of one frame, driven by [`FrameScheduler`].
pub trait FrameBackend {
    /// Blocks until the slot's previous submission has finished.
    fn wait_for_frame(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireStatus>;
    /// Claims `image_index` for the slot and resets the slot's fence.
    fn begin_frame(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn update_uniforms(&mut self, slot: usize) -> Result<()>;
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentStatus>;
    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome>;
}

/// Resize notification shared with the window event handler.
#[derive(Clone, Debug, Default)]
pub struct ResizeSignal(Arc<AtomicBool>);

impl ResizeSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether the signal was raised and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    WaitingOnFence,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, then the swapchain was rebuilt for the next frame.
    PresentedAndRecreated,
    /// The swapchain was out of date; nothing was recorded.
    Abandoned,
    /// Recreation is waiting for a non-zero framebuffer.
    Deferred,
}

/// Cycles frame slots through wait, acquire, record, submit and present.
#[derive(Debug)]
pub struct FrameScheduler {
    frame_count: usize,
    frame: usize,
    slots: Vec<SlotState>,
    resize: ResizeSignal,
    recreate_pending: bool,
}

impl FrameScheduler {
    pub fn new(frame_count: usize, resize: ResizeSignal) -> Self {
        let frame_count = frame_count.max(1);
        Self {
            frame_count,
            frame: 0,
            slots: vec![SlotState::Idle; frame_count],
            resize,
            recreate_pending: false,
        }
    }

    /// Slot the next frame will use.
    #[cfg(test)]
    fn current_frame(&self) -> usize {
        self.frame
    }

    #[cfg(test)]
    fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    pub fn resize_signal(&self) -> ResizeSignal {
        self.resize.clone()
    }

    /// Requests a swapchain rebuild before the next acquire.
    #[cfg(test)]
    fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    #[cfg(test)]
    fn recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        if self.recreate_pending || self.resize.is_raised() {
            self.resize.take();
            if !self.recreate(backend)? {
                return Ok(FrameOutcome::Deferred);
            }
        }

        let slot = self.frame;
        let outcome = self.run_slot(backend, slot);
        outcome.with_context(|| format!("Frame slot {} failed while {:?}.", slot, self.slots[slot]))
    }

    fn run_slot<B: FrameBackend>(&mut self, backend: &mut B, slot: usize) -> Result<FrameOutcome> {
        self.slots[slot] = SlotState::WaitingOnFence;
        backend.wait_for_frame(slot)?;

        self.slots[slot] = SlotState::Acquiring;
        let (image_index, suboptimal) = match backend.acquire_image(slot)? {
            AcquireStatus::Ready(index) => (index, false),
            AcquireStatus::Suboptimal(index) => (index, true),
            AcquireStatus::OutOfDate => {
                debug!("Swapchain out of date on acquire; abandoning frame.");
                self.slots[slot] = SlotState::Idle;
                self.recreate(backend)?;
                return Ok(FrameOutcome::Abandoned);
            }
        };

        self.slots[slot] = SlotState::Recording;
        backend.begin_frame(slot, image_index)?;
        backend.record(slot, image_index)?;
        backend.update_uniforms(slot)?;

        backend.submit(slot)?;
        self.slots[slot] = SlotState::Submitted;

        self.slots[slot] = SlotState::Presenting;
        let status = backend.present(slot, image_index)?;
        self.slots[slot] = SlotState::Idle;

        let resized = self.resize.take();
        let outcome = if suboptimal || resized || status != PresentStatus::Presented {
            debug!("Recreating swapchain after present ({:?}, resized: {}).", status, resized);
            self.recreate(backend)?;
            FrameOutcome::PresentedAndRecreated
        } else {
            FrameOutcome::Presented
        };

        self.frame = (self.frame + 1) % self.frame_count;
        Ok(outcome)
    }

    /// Returns `false` when recreation had to be deferred.
    fn recreate<B: FrameBackend>(&mut self, backend: &mut B) -> Result<bool> {
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
    use std::collections::VecDeque;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Begin(usize, u32),
        Record(usize, u32),
        Uniforms(usize),
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    /// Swapchain stand-in that hands out images round-robin and tracks fences.
    #[derive(Default)]
    struct MockBackend {
        calls: Vec<Call>,
        image_count: u32,
        next_image: u32,
        acquire_script: VecDeque<AcquireStatus>,
        present_script: VecDeque<PresentStatus>,
        recreate_script: VecDeque<RecreateOutcome>,
        pending: Vec<bool>,
        fence_waits: Vec<usize>,
        resize_on_submit: Option<ResizeSignal>,
        fail_submit: bool,
        max_pending: usize,
    }

    impl MockBackend {
        fn new(image_count: u32, frames: usize) -> Self {
            Self {
                image_count,
                pending: vec![false; frames],
                fence_waits: vec![0; frames],
                ..Default::default()
            }
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.fence_waits[slot] += 1;
            self.pending[slot] = false;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireStatus> {
            self.calls.push(Call::Acquire(slot));
            if let Some(status) = self.acquire_script.pop_front() {
                return Ok(status);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireStatus::Ready(index))
        }

        fn begin_frame(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Begin(slot, image_index));
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert!(!self.pending[slot], "slot {} re-recorded while its submission is pending", slot);
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn update_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Uniforms(slot));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            if self.fail_submit {
                return Err(anyhow::anyhow!("device lost"));
            }
            self.pending[slot] = true;
            let pending = self.pending.iter().filter(|p| **p).count();
            self.max_pending = self.max_pending.max(pending);
            if let Some(signal) = &self.resize_on_submit {
                signal.raise();
            }
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentStatus> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.present_script.pop_front().unwrap_or(PresentStatus::Presented))
        }

        fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
            self.calls.push(Call::Recreate);
            self.next_image = 0;
            Ok(self.recreate_script.pop_front().unwrap_or(RecreateOutcome::Recreated))
        }
    }

    fn is_record(call: &Call) -> bool {
        matches!(call, Call::Record(..))
    }

    #[test]
    fn ten_frames_present_ten_times() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        for _ in 0..10 {
            assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(backend.count(|c| matches!(c, Call::Present(..))), 10);
        assert_eq!(backend.count(|c| *c == Call::Recreate), 0);
        // One slot waits on its fence before the other may be submitted again.
        assert!(backend.max_pending <= 2);
        for slot in 0..2 {
            assert!(backend.fence_waits[slot] <= 5);
        }
    }

    #[test]
    fn every_slot_waits_on_its_fence() {
        for frames in 2..=4 {
            let mut scheduler = FrameScheduler::new(frames, ResizeSignal::default());
            let mut backend = MockBackend::new(3, frames);
            let k = 3 * frames + 1;
            for _ in 0..k {
                scheduler.draw_frame(&mut backend).unwrap();
            }
            for slot in 0..frames {
                assert!(backend.fence_waits[slot] >= k / frames);
            }
        }
    }

    #[test]
    fn slot_protocol_runs_in_order() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        scheduler.draw_frame(&mut backend).unwrap();
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Begin(0, 0),
                Call::Record(0, 0),
                Call::Uniforms(0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(scheduler.current_frame(), 1);
        assert_eq!(scheduler.slot_state(0), SlotState::Idle);
    }

    #[test]
    fn out_of_date_acquire_abandons_the_frame() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        backend.acquire_script.push_back(AcquireStatus::OutOfDate);

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameOutcome::Abandoned);
        assert_eq!(backend.count(is_record), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::Submit(..))), 0);
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
        assert_eq!(scheduler.current_frame(), 0);

        scheduler.draw_frame(&mut backend).unwrap();
        let recreates = backend.count(|c| *c == Call::Recreate);
        assert_eq!(recreates, 1);
        let acquires: Vec<_> = backend
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Acquire(..)))
            .map(|(i, _)| i)
            .collect();
        let recreate_at = backend.calls.iter().position(|c| *c == Call::Recreate).unwrap();
        assert!(acquires[0] < recreate_at && recreate_at < acquires[1]);
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        backend.acquire_script.push_back(AcquireStatus::Suboptimal(1));

        assert_eq!(
            scheduler.draw_frame(&mut backend).unwrap(),
            FrameOutcome::PresentedAndRecreated
        );
        let present_at = backend.calls.iter().position(|c| *c == Call::Present(0, 1)).unwrap();
        let recreate_at = backend.calls.iter().position(|c| *c == Call::Recreate).unwrap();
        assert!(present_at < recreate_at);
    }

    #[test]
    fn out_of_date_present_recreates_after_the_frame() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        backend.present_script.push_back(PresentStatus::OutOfDate);

        assert_eq!(
            scheduler.draw_frame(&mut backend).unwrap(),
            FrameOutcome::PresentedAndRecreated
        );
        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);
        assert_eq!(scheduler.current_frame(), 1);
    }

    #[test]
    fn resize_mid_frame_is_handled_before_the_next_record() {
        let signal = ResizeSignal::default();
        let mut scheduler = FrameScheduler::new(2, signal.clone());
        let mut backend = MockBackend::new(3, 2);
        backend.resize_on_submit = Some(signal.clone());

        scheduler.draw_frame(&mut backend).unwrap();
        backend.resize_on_submit = None;
        scheduler.draw_frame(&mut backend).unwrap();

        assert_eq!(backend.count(|c| matches!(c, Call::Present(0, _))), 1);
        let records: Vec<_> = backend
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| is_record(c))
            .map(|(i, _)| i)
            .collect();
        let present_at = backend.calls.iter().position(|c| matches!(c, Call::Present(0, _))).unwrap();
        let recreate_at = backend.calls.iter().position(|c| *c == Call::Recreate).unwrap();
        assert!(present_at < recreate_at);
        assert!(recreate_at < records[1]);
        assert!(!signal.is_raised());
    }

    #[test]
    fn minimized_window_defers_until_it_has_area() {
        let signal = ResizeSignal::default();
        let mut scheduler = FrameScheduler::new(2, signal.clone());
        let mut backend = MockBackend::new(3, 2);
        backend.recreate_script.extend([RecreateOutcome::Deferred, RecreateOutcome::Deferred]);

        signal.raise();
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameOutcome::Deferred);
        assert!(scheduler.recreate_pending());
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameOutcome::Deferred);
        assert_eq!(backend.count(|c| matches!(c, Call::Acquire(..))), 0);

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameOutcome::Presented);
        assert!(!scheduler.recreate_pending());
        assert_eq!(backend.count(|c| *c == Call::Recreate), 3);
    }

    #[test]
    fn back_to_back_recreation_is_harmless() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        scheduler.request_recreate();
        scheduler.draw_frame(&mut backend).unwrap();
        scheduler.request_recreate();
        scheduler.draw_frame(&mut backend).unwrap();
        assert_eq!(backend.count(|c| *c == Call::Recreate), 2);
        assert_eq!(backend.count(|c| matches!(c, Call::Present(..))), 2);
    }

    #[test]
    fn failed_submit_names_the_slot_and_step() {
        let mut scheduler = FrameScheduler::new(2, ResizeSignal::default());
        let mut backend = MockBackend::new(3, 2);
        scheduler.draw_frame(&mut backend).unwrap();
        backend.fail_submit = true;

        let error = scheduler.draw_frame(&mut backend).unwrap_err();
        assert_eq!(error.to_string(), "Frame slot 1 failed while Recording.");
        assert_eq!(error.root_cause().to_string(), "device lost");
        assert_eq!(scheduler.slot_state(1), SlotState::Recording);
        assert_eq!(scheduler.current_frame(), 1);
    }
}
