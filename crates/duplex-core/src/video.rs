//! Video negotiation and the video collaborator interfaces.
//!
//! Local video state only moves towards `Active` through a signaling
//! exchange with the peer; remote video state is driven purely by the
//! peer's `VideoStream` messages. The negotiator is a pure state machine:
//! every operation returns the signaling messages the session has to send.

use crate::signaling::SignalingMessage;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Local video state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum VideoState {
    /// Video can be requested
    #[default]
    Possible,
    /// We asked the peer and wait for its answer
    OutgoingRequested,
    /// The peer asked us
    IncomingRequested,
    /// Both sides agreed
    Active,
}

/// Peer's outgoing video stream as reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum RemoteVideoState {
    /// No stream
    #[default]
    Inactive,
    /// Stream flowing
    Active,
}

/// Rotation of a rendered video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum VideoOrientation {
    /// Upright
    #[default]
    Rotation0,
    /// Rotated 90° clockwise
    Rotation90,
    /// Upside down
    Rotation180,
    /// Rotated 270° clockwise
    Rotation270,
}

/// Capture device errors. Never fatal to the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No capturer attached to the session
    #[error("no video capturer attached")]
    NoCapturer,
    /// Device has a single camera
    #[error("no alternate camera")]
    NoAlternateCamera,
    /// Platform capture failure
    #[error("capture device error: {0}")]
    Device(String),
}

/// Hook fired when the first frame reaches a view.
pub type FirstFrameCallback = Box<dyn Fn() + Send + Sync>;

/// Hook fired when a view's orientation changes.
pub type OrientationCallback = Box<dyn Fn(VideoOrientation) + Send + Sync>;

/// Completion receiving a view, or `None` when none can be made.
pub type ViewCompletion = Box<dyn FnOnce(Option<Arc<dyn VideoView>>) + Send>;

/// Renderer surface, consumed by the core.
pub trait VideoView: Send + Sync {
    /// Current orientation of rendered frames
    fn orientation(&self) -> VideoOrientation;

    /// Install or clear the first-frame hook
    fn set_on_first_frame_received(&self, callback: Option<FirstFrameCallback>);

    /// Install or clear the orientation hook
    fn set_on_orientation_updated(&self, callback: Option<OrientationCallback>);
}

/// Camera capture collaborator.
pub trait VideoCapturer: Send + Sync {
    /// Switch between front and back cameras
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if the device cannot switch.
    fn switch_camera(&self) -> Result<(), CaptureError>;

    /// Start or pause capturing
    fn set_video_enabled(&self, enabled: bool);

    /// Produce the local preview view
    fn make_outgoing_view(&self, completion: ViewCompletion);
}

/// Produces views for the peer's incoming video.
pub trait VideoViewFactory: Send + Sync {
    /// Make a view for the incoming stream
    fn make_incoming_view(&self) -> Option<Arc<dyn VideoView>>;
}

/// A view with a fixed frame source, useful headless and in tests.
///
/// Frames and rotations are injected with [`deliver_frame`](Self::deliver_frame)
/// and [`rotate`](Self::rotate).
#[derive(Default)]
pub struct StaticVideoView {
    inner: Mutex<StaticViewState>,
}

#[derive(Default)]
struct StaticViewState {
    orientation: VideoOrientation,
    frames: u64,
    on_first_frame: Option<Arc<dyn Fn() + Send + Sync>>,
    on_orientation: Option<Arc<dyn Fn(VideoOrientation) + Send + Sync>>,
}

impl StaticVideoView {
    /// Create a view in `Rotation0` with no frames seen
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one frame; the first one fires the first-frame hook.
    pub fn deliver_frame(&self) {
        let hook = {
            let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            state.frames += 1;
            if state.frames == 1 {
                state.on_first_frame.clone()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Change orientation, firing the orientation hook on change.
    pub fn rotate(&self, orientation: VideoOrientation) {
        let hook = {
            let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if state.orientation == orientation {
                return;
            }
            state.orientation = orientation;
            state.on_orientation.clone()
        };
        if let Some(hook) = hook {
            hook(orientation);
        }
    }

    /// Frames delivered so far
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).frames
    }
}

impl VideoView for StaticVideoView {
    fn orientation(&self) -> VideoOrientation {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .orientation
    }

    fn set_on_first_frame_received(&self, callback: Option<FirstFrameCallback>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_first_frame = callback.map(Arc::from);
    }

    fn set_on_orientation_updated(&self, callback: Option<OrientationCallback>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_orientation = callback.map(Arc::from);
    }
}

/// Local/remote video state machine of one session.
pub struct VideoNegotiator {
    local: VideoState,
    remote: RemoteVideoState,
    capturer: Option<Arc<dyn VideoCapturer>>,
    peer_supports_video: Option<bool>,
    enabled: bool,
}

impl Default for VideoNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoNegotiator {
    /// Start in `Possible` / `Inactive` with video enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: VideoState::Possible,
            remote: RemoteVideoState::Inactive,
            capturer: None,
            peer_supports_video: None,
            enabled: true,
        }
    }

    /// Local video state
    #[must_use]
    pub fn local(&self) -> VideoState {
        self.local
    }

    /// Remote video state
    #[must_use]
    pub fn remote(&self) -> RemoteVideoState {
        self.remote
    }

    /// Whether a capturer is attached
    #[must_use]
    pub fn has_capturer(&self) -> bool {
        self.capturer.is_some()
    }

    /// Whether local video is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn attach(&mut self, capturer: Option<Arc<dyn VideoCapturer>>) {
        if let Some(capturer) = capturer {
            capturer.set_video_enabled(self.enabled);
            self.capturer = Some(capturer);
        }
    }

    fn activate(&mut self) -> Vec<SignalingMessage> {
        self.local = VideoState::Active;
        tracing::debug!("Local video active");
        vec![SignalingMessage::VideoStream {
            active: self.enabled && self.capturer.is_some(),
        }]
    }

    /// Ask the peer for video; accepts instead if the peer already asked.
    pub fn request_video(
        &mut self,
        capturer: Option<Arc<dyn VideoCapturer>>,
    ) -> Vec<SignalingMessage> {
        match self.local {
            VideoState::Possible => {
                if self.peer_supports_video == Some(false) {
                    tracing::debug!("Peer does not support video, request ignored");
                    return Vec::new();
                }
                self.attach(capturer);
                self.local = VideoState::OutgoingRequested;
                vec![SignalingMessage::VideoRequest]
            }
            VideoState::IncomingRequested => self.accept_video(capturer),
            VideoState::OutgoingRequested | VideoState::Active => {
                self.attach(capturer);
                Vec::new()
            }
        }
    }

    /// Accept the peer's pending request.
    pub fn accept_video(
        &mut self,
        capturer: Option<Arc<dyn VideoCapturer>>,
    ) -> Vec<SignalingMessage> {
        if self.local != VideoState::IncomingRequested {
            tracing::debug!("No incoming video request to accept ({:?})", self.local);
            return Vec::new();
        }
        self.attach(capturer);

        let mut out = vec![SignalingMessage::VideoAccept];
        out.extend(self.activate());
        out
    }

    /// Apply a message from the peer; returns replies.
    pub fn on_message(&mut self, message: &SignalingMessage) -> Vec<SignalingMessage> {
        match message {
            SignalingMessage::Capabilities { supports_video, .. } => {
                self.peer_supports_video = Some(*supports_video);
                Vec::new()
            }
            SignalingMessage::VideoRequest => match self.local {
                VideoState::Possible => {
                    self.local = VideoState::IncomingRequested;
                    Vec::new()
                }
                // Both sides asked at once: each request accepts the other
                VideoState::OutgoingRequested => self.activate(),
                VideoState::IncomingRequested | VideoState::Active => Vec::new(),
            },
            SignalingMessage::VideoAccept => {
                if self.local == VideoState::OutgoingRequested {
                    self.activate()
                } else {
                    Vec::new()
                }
            }
            SignalingMessage::VideoStream { active } => {
                self.remote = if *active {
                    RemoteVideoState::Active
                } else {
                    RemoteVideoState::Inactive
                };
                Vec::new()
            }
        }
    }

    /// Pause or resume local video.
    pub fn set_video_enabled(&mut self, enabled: bool) -> Vec<SignalingMessage> {
        if self.enabled == enabled {
            return Vec::new();
        }
        self.enabled = enabled;
        if let Some(capturer) = &self.capturer {
            capturer.set_video_enabled(enabled);
        }

        if self.local == VideoState::Active {
            vec![SignalingMessage::VideoStream {
                active: enabled && self.capturer.is_some(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Switch cameras on the attached capturer.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NoCapturer`] without a capturer, or the
    /// capturer's own error.
    pub fn switch_camera(&self) -> Result<(), CaptureError> {
        self.capturer
            .as_ref()
            .ok_or(CaptureError::NoCapturer)?
            .switch_camera()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockCapturer {
        enabled: AtomicBool,
        switches: AtomicUsize,
        broken: bool,
    }

    impl VideoCapturer for MockCapturer {
        fn switch_camera(&self) -> Result<(), CaptureError> {
            if self.broken {
                return Err(CaptureError::NoAlternateCamera);
            }
            self.switches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_video_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn make_outgoing_view(&self, completion: ViewCompletion) {
            completion(Some(Arc::new(StaticVideoView::new())));
        }
    }

    fn capabilities(supports_video: bool) -> SignalingMessage {
        SignalingMessage::Capabilities {
            version: "3.0.0".into(),
            max_layer: 92,
            supports_video,
        }
    }

    #[test]
    fn test_request_then_accept() {
        let mut video = VideoNegotiator::new();
        let capturer = Arc::new(MockCapturer::default());

        let out = video.request_video(Some(capturer.clone()));
        assert_eq!(out, vec![SignalingMessage::VideoRequest]);
        assert_eq!(video.local(), VideoState::OutgoingRequested);
        assert!(capturer.enabled.load(Ordering::SeqCst));

        // Nothing else moves it
        video.on_message(&SignalingMessage::VideoStream { active: true });
        assert_eq!(video.local(), VideoState::OutgoingRequested);

        let out = video.on_message(&SignalingMessage::VideoAccept);
        assert_eq!(video.local(), VideoState::Active);
        assert_eq!(out, vec![SignalingMessage::VideoStream { active: true }]);
    }

    #[test]
    fn test_incoming_request_and_accept() {
        let mut video = VideoNegotiator::new();
        video.on_message(&SignalingMessage::VideoRequest);
        assert_eq!(video.local(), VideoState::IncomingRequested);

        let out = video.accept_video(None);
        assert_eq!(video.local(), VideoState::Active);
        assert_eq!(
            out,
            vec![
                SignalingMessage::VideoAccept,
                SignalingMessage::VideoStream { active: false }
            ]
        );
    }

    #[test]
    fn test_glare_activates_both() {
        let mut video = VideoNegotiator::new();
        video.request_video(None);
        let out = video.on_message(&SignalingMessage::VideoRequest);
        assert_eq!(video.local(), VideoState::Active);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_accept_without_request_is_noop() {
        let mut video = VideoNegotiator::new();
        assert!(video.accept_video(None).is_empty());
        assert!(video.on_message(&SignalingMessage::VideoAccept).is_empty());
        assert_eq!(video.local(), VideoState::Possible);
    }

    #[test]
    fn test_remote_state_only_from_stream_messages() {
        let mut video = VideoNegotiator::new();
        video.request_video(None);
        video.on_message(&SignalingMessage::VideoAccept);
        assert_eq!(video.remote(), RemoteVideoState::Inactive);

        video.on_message(&SignalingMessage::VideoStream { active: true });
        assert_eq!(video.remote(), RemoteVideoState::Active);
        video.on_message(&SignalingMessage::VideoStream { active: false });
        assert_eq!(video.remote(), RemoteVideoState::Inactive);
    }

    #[test]
    fn test_peer_without_video() {
        let mut video = VideoNegotiator::new();
        video.on_message(&capabilities(false));
        assert!(video.request_video(None).is_empty());
        assert_eq!(video.local(), VideoState::Possible);
    }

    #[test]
    fn test_set_video_enabled() {
        let mut video = VideoNegotiator::new();
        let capturer = Arc::new(MockCapturer::default());
        video.on_message(&SignalingMessage::VideoRequest);
        video.accept_video(Some(capturer.clone()));

        let out = video.set_video_enabled(false);
        assert_eq!(out, vec![SignalingMessage::VideoStream { active: false }]);
        assert!(!capturer.enabled.load(Ordering::SeqCst));
        assert!(video.set_video_enabled(false).is_empty());
    }

    #[test]
    fn test_switch_camera_errors_are_reported() {
        let mut video = VideoNegotiator::new();
        assert_eq!(video.switch_camera(), Err(CaptureError::NoCapturer));

        let broken = Arc::new(MockCapturer {
            broken: true,
            ..Default::default()
        });
        video.request_video(Some(broken));
        assert_eq!(video.switch_camera(), Err(CaptureError::NoAlternateCamera));
        assert_eq!(video.local(), VideoState::OutgoingRequested);
    }

    #[test]
    fn test_static_view_hooks() {
        let view = StaticVideoView::new();
        let first = Arc::new(AtomicUsize::new(0));
        let rotations = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&first);
        view.set_on_first_frame_received(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let seen = Arc::clone(&rotations);
        view.set_on_orientation_updated(Some(Box::new(move |o| seen.lock().unwrap().push(o))));

        view.deliver_frame();
        view.deliver_frame();
        view.rotate(VideoOrientation::Rotation90);
        view.rotate(VideoOrientation::Rotation90);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(view.frames(), 2);
        assert_eq!(*rotations.lock().unwrap(), vec![VideoOrientation::Rotation90]);
        assert_eq!(view.orientation(), VideoOrientation::Rotation90);

        let capturer = MockCapturer::default();
        let made = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&made);
        capturer.make_outgoing_view(Box::new(move |view| {
            flag.store(view.is_some(), Ordering::SeqCst);
        }));
        assert!(made.load(Ordering::SeqCst));
    }
}
