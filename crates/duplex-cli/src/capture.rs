//! Headless camera for simulated video calls.

use duplex_core::video::{StaticVideoView, ViewCompletion};
use duplex_core::{CaptureError, VideoCapturer, VideoView, VideoViewFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capturer with a front and a back camera and no real frames.
pub struct SimulatedCapturer {
    label: &'static str,
    front: AtomicBool,
    enabled: AtomicBool,
}

impl SimulatedCapturer {
    /// Create a capturer starting on the front camera
    #[must_use]
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            front: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        })
    }

    /// Whether the front camera is selected
    #[must_use]
    pub fn is_front(&self) -> bool {
        self.front.load(Ordering::Relaxed)
    }

    /// Whether capture is running
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl VideoCapturer for SimulatedCapturer {
    fn switch_camera(&self) -> Result<(), CaptureError> {
        let was_front = self.front.fetch_xor(true, Ordering::Relaxed);
        tracing::info!(
            "[{}] switched to {} camera",
            self.label,
            if was_front { "back" } else { "front" }
        );
        Ok(())
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!("[{}] capture {}", self.label, if enabled { "on" } else { "off" });
    }

    fn make_outgoing_view(&self, completion: ViewCompletion) {
        let view: Arc<dyn VideoView> = Arc::new(StaticVideoView::new());
        completion(Some(view));
    }
}

/// Hands out a fresh [`StaticVideoView`] for every incoming stream.
pub struct StaticViewFactory;

impl VideoViewFactory for StaticViewFactory {
    fn make_incoming_view(&self) -> Option<Arc<dyn VideoView>> {
        Some(Arc::new(StaticVideoView::new()))
    }
}
