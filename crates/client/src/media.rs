//! Capture and render devices are external collaborators owned by the
//! caller; the engine only ever borrows them through these traits.

/// One media sample pulled from (or pushed to) a capture/render device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts_us: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts_us: u64,
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Stream parameters advertised once per inbound audio track, used to
/// configure the renderer.
#[derive(Debug, Clone, Copy)]
pub struct AudioStreamInfo {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

/// A borrowed capture source. `try_recv_audio`/`try_recv_video` are
/// non-blocking: the publish-pipeline stream task drains all available
/// audio frames per tick and at most one video frame.
pub trait Capturer: Send + Sync {
    fn start(&self) -> Result<(), String>;
    fn stop(&self);
    fn try_recv_audio(&self) -> Option<AudioFrame>;
    fn try_recv_video(&self) -> Option<VideoFrame>;
}

/// A borrowed render sink for the single subscribed remote audio track.
pub trait Renderer: Send + Sync {
    fn configure(&self, info: AudioStreamInfo);
    fn push_audio(&self, frame: AudioFrame);
    /// Called on `close`/`Leave`, before the renderer is released.
    fn reset(&self);
}

/// Maps a negotiated audio codec onto the stream info the renderer expects.
/// G.711 A-law/u-law are fixed at 8 kHz mono; everything else uses the
/// advertised rate and channel count. 16 bits/sample always (`engine.c`
/// `on_peer_sub_audio_info`).
pub fn audio_stream_info(codec: AudioCodec, advertised_rate: u32, advertised_channels: u8) -> AudioStreamInfo {
    match codec {
        AudioCodec::G711A | AudioCodec::G711U => AudioStreamInfo {
            sample_rate_hz: 8000,
            channels: 1,
            bits_per_sample: 16,
        },
        AudioCodec::Opus => AudioStreamInfo {
            sample_rate_hz: advertised_rate,
            channels: advertised_channels,
            bits_per_sample: 16,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    G711A,
    G711U,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    /// MJPEG over a data channel is not supported yet. Kept as a variant
    /// so that rejection is a runtime `InvalidArg` on a value a caller can
    /// actually construct, rather than removing the codec choice entirely.
    Mjpeg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g711_forces_narrowband_mono() {
        let info = audio_stream_info(AudioCodec::G711A, 48000, 2);
        assert_eq!(info.sample_rate_hz, 8000);
        assert_eq!(info.channels, 1);
    }

    #[test]
    fn opus_keeps_advertised_rate_and_channels() {
        let info = audio_stream_info(AudioCodec::Opus, 48000, 2);
        assert_eq!(info.sample_rate_hz, 48000);
        assert_eq!(info.channels, 2);
    }
}
