use std::sync::Arc;

use crate::media::{AudioCodec, Capturer, Renderer, VideoCodec};

bitflags::bitflags! {
    /// Which media kinds a publish/subscribe direction covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MediaKind: u8 {
        const NONE = 0;
        const AUDIO = 1 << 0;
        const VIDEO = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct AudioEncodeOptions {
    pub codec: AudioCodec,
    pub sample_rate_hz: u32,
    pub channels: u8,
}

#[derive(Debug, Clone)]
pub struct VideoEncodeOptions {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Clone)]
pub struct PublishOptions {
    pub kind: MediaKind,
    pub audio_encode: Option<AudioEncodeOptions>,
    pub video_encode: Option<VideoEncodeOptions>,
    pub capturer: Option<Arc<dyn Capturer>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            kind: MediaKind::NONE,
            audio_encode: None,
            video_encode: None,
            capturer: None,
        }
    }
}

#[derive(Clone)]
pub struct SubscribeOptions {
    pub kind: MediaKind,
    pub renderer: Option<Arc<dyn Renderer>>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            kind: MediaKind::NONE,
            renderer: None,
        }
    }
}

/// Whether ICE is restricted to relay candidates only.
#[derive(Debug, Clone, Copy, Default)]
pub struct IceOptions {
    pub force_relay: bool,
}

#[derive(Clone)]
pub struct RoomOptions {
    pub publish: PublishOptions,
    pub subscribe: SubscribeOptions,
    pub ice: IceOptions,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            publish: PublishOptions::default(),
            subscribe: SubscribeOptions::default(),
            ice: IceOptions::default(),
        }
    }
}

impl RoomOptions {
    /// Validates that publish/subscribe configuration is internally
    /// consistent, in the order `livekit_room_create` checks them. Collects
    /// every violation rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.publish.kind != MediaKind::NONE && self.publish.capturer.is_none() {
            issues.push("ERROR: publish.kind is set but no capturer was supplied".to_string());
        }
        if self.subscribe.kind != MediaKind::NONE && self.subscribe.renderer.is_none() {
            issues.push("ERROR: subscribe.kind is set but no renderer was supplied".to_string());
        }
        if self.publish.kind.contains(MediaKind::AUDIO) && self.publish.audio_encode.is_none() {
            issues.push("ERROR: publish.kind includes audio but audio_encode is unset".to_string());
        }
        if self.publish.kind.contains(MediaKind::VIDEO) && self.publish.video_encode.is_none() {
            issues.push("ERROR: publish.kind includes video but video_encode is unset".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioFrame, VideoFrame};

    struct NoopCapturer;
    impl Capturer for NoopCapturer {
        fn start(&self) -> Result<(), String> {
            Ok(())
        }
        fn stop(&self) {}
        fn try_recv_audio(&self) -> Option<AudioFrame> {
            None
        }
        fn try_recv_video(&self) -> Option<VideoFrame> {
            None
        }
    }

    struct NoopRenderer;
    impl Renderer for NoopRenderer {
        fn configure(&self, _info: crate::media::AudioStreamInfo) {}
        fn push_audio(&self, _frame: AudioFrame) {}
        fn reset(&self) {}
    }

    #[test]
    fn default_options_are_valid() {
        assert!(RoomOptions::default().validate().is_ok());
    }

    #[test]
    fn publish_audio_without_capturer_is_rejected() {
        let opts = RoomOptions {
            publish: PublishOptions {
                kind: MediaKind::AUDIO,
                audio_encode: Some(AudioEncodeOptions {
                    codec: AudioCodec::Opus,
                    sample_rate_hz: 48000,
                    channels: 1,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let issues = opts.validate().unwrap_err();
        assert!(issues.iter().any(|s| s.contains("capturer")));
    }

    #[test]
    fn publish_audio_without_codec_is_rejected() {
        let opts = RoomOptions {
            publish: PublishOptions {
                kind: MediaKind::AUDIO,
                capturer: Some(Arc::new(NoopCapturer)),
                ..Default::default()
            },
            ..Default::default()
        };
        let issues = opts.validate().unwrap_err();
        assert!(issues.iter().any(|s| s.contains("audio_encode")));
    }

    #[test]
    fn subscribe_without_renderer_is_rejected() {
        let opts = RoomOptions {
            subscribe: SubscribeOptions {
                kind: MediaKind::AUDIO,
                renderer: None,
            },
            ..Default::default()
        };
        let issues = opts.validate().unwrap_err();
        assert!(issues.iter().any(|s| s.contains("renderer")));
    }

    #[test]
    fn fully_configured_publish_and_subscribe_is_valid() {
        let opts = RoomOptions {
            publish: PublishOptions {
                kind: MediaKind::AUDIO,
                audio_encode: Some(AudioEncodeOptions {
                    codec: AudioCodec::Opus,
                    sample_rate_hz: 48000,
                    channels: 1,
                }),
                capturer: Some(Arc::new(NoopCapturer)),
                ..Default::default()
            },
            subscribe: SubscribeOptions {
                kind: MediaKind::AUDIO,
                renderer: Some(Arc::new(NoopRenderer)),
            },
            ice: IceOptions::default(),
        };
        assert!(opts.validate().is_ok());
    }
}
