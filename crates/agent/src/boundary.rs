//! Where a Direct3D 9 frame ends.
//!
//! Device `Present` is the boundary: every scene of the frame has ended and
//! the backbuffer holds the finished image. Until the first `Present` is seen
//! (hosts that present through an additional swap chain never call it), each
//! top-level `EndScene` stands in for it.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct FrameBoundary {
    present_seen: AtomicBool,
    stepped: AtomicBool,
}

impl FrameBoundary {
    pub const fn new() -> Self {
        Self {
            present_seen: AtomicBool::new(false),
            stepped: AtomicBool::new(false),
        }
    }

    /// A top-level `EndScene` returned. True if the frame step runs now.
    pub fn on_end_scene(&self) -> bool {
        if self.present_seen.load(Ordering::Acquire) {
            return false;
        }
        self.stepped.store(true, Ordering::Release);
        true
    }

    /// Device `Present` is about to run. True if the frame step runs first;
    /// false when an `EndScene` of this frame already ran it.
    pub fn on_present(&self) -> bool {
        self.present_seen.store(true, Ordering::Release);
        !self.stepped.swap(false, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.present_seen.store(false, Ordering::Release);
        self.stepped.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_scene_frames_step_once_at_present() {
        let boundary = FrameBoundary::new();
        // First frame: Present not known yet
        assert!(boundary.on_end_scene());
        assert!(!boundary.on_present());

        for _ in 0..3 {
            assert!(!boundary.on_end_scene());
            assert!(!boundary.on_end_scene());
            assert!(!boundary.on_end_scene());
            assert!(boundary.on_present());
        }
    }

    #[test]
    fn end_scene_drives_frames_without_present() {
        let boundary = FrameBoundary::new();
        for _ in 0..3 {
            assert!(boundary.on_end_scene());
        }
    }

    #[test]
    fn frames_without_scenes_still_step() {
        let boundary = FrameBoundary::new();
        assert!(boundary.on_present());
        assert!(boundary.on_present());
    }

    #[test]
    fn reset_falls_back_to_end_scene() {
        let boundary = FrameBoundary::new();
        assert!(boundary.on_present());
        boundary.reset();
        assert!(boundary.on_end_scene());
    }
}
