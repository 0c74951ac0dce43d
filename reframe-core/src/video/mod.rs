//! video — FFmpeg bridge
//!
//! `FrameSource` hands out decoded RGB24 frames one at a time and
//! `FrameSink` appends frames to an encoded output at a fixed size. The
//! pipeline only talks to the traits; the FFmpeg-backed types below are the
//! production implementations.

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    Dictionary, Packet, codec, encoder, format, frame, media, software::scaling,
    util::rational::Rational,
};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::ReframeError;
use crate::output::InputSource;

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
const MIN_MPEG4_BIT_RATE: usize = 400_000;
/// Scaling flags — bilinear is fast and good enough for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format, along with its index in the
/// input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub index: u64,
}

impl RgbFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let frame = Self {
            data,
            width,
            height,
            index,
        };
        frame.check_buffer()?;
        Ok(frame)
    }

    /// Fields are public, so consumers re-check the buffer before slicing rows.
    pub fn check_buffer(&self) -> Result<(), ReframeError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            return Err(ReframeError::FrameBufferSize {
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Solid-colour frame, mostly useful for fixtures.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], index: u64) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            data,
            width,
            height,
            index,
        }
    }
}

/// Native properties of an opened input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Frame rate rounded to the nearest integer.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Best-effort frame count; 0 when unknown (live cameras, some containers).
    pub total_frames: u64,
}

/// Resolution and rate an output is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSpec {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

/// Video codec for the output stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputCodec {
    /// MPEG-4 Part 2 (`mp4v`).
    #[default]
    Mp4v,
    H264,
}

impl OutputCodec {
    fn codec_id(self) -> codec::Id {
        match self {
            Self::Mp4v => codec::Id::MPEG4,
            Self::H264 => codec::Id::H264,
        }
    }

    fn options(self) -> Dictionary<'static> {
        match self {
            Self::Mp4v => Dictionary::new(),
            Self::H264 => Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
        }
    }
}

/// What a sink did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Not encoded, e.g. its size differs from the size the sink was opened at.
    Dropped,
}

/// Sequential frame reader. Released when dropped.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// Next frame, `Ok(None)` at end of stream, `Err` on a read/decode failure.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Ordered frame writer opened at a fixed resolution.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<WriteOutcome>;

    /// Flush pending output and close the stream. Must be idempotent.
    fn finish(&mut self) -> Result<()>;
}

// ── FFmpeg source ────────────────────────────────────────────────────────────

pub struct FfmpegSource {
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    video_stream_index: usize,
    decoded: frame::Video,
    rgb: frame::Video,
    info: StreamInfo,
    eof_sent: bool,
    frames_read: u64,
}

impl FfmpegSource {
    pub fn open(input: &InputSource) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = match input {
            InputSource::File(path) => format::input(path)
                .with_context(|| format!("could not open input file {}", path.display()))?,
            InputSource::Camera(index) => open_camera(*index)?,
        };

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| ReframeError::NoVideoStream(input.describe()))?;
        let video_stream_index = stream.index();
        let fps = rounded_fps(stream.avg_frame_rate());
        let total_frames = estimate_frames(&stream);

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let src_pixel_fmt = decoder.format();

        let to_rgb = scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            input = %input.describe(),
            width,
            height,
            fps,
            total_frames,
            ?src_pixel_fmt,
            "opened input video stream"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            video_stream_index,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            info: StreamInfo {
                fps,
                width,
                height,
                total_frames,
            },
            eof_sent: false,
            frames_read: 0,
        })
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.info.width as usize;
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width * self.info.height as usize * 3);
        for row in 0..self.info.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let frame = RgbFrame {
            data,
            width: self.info.width,
            height: self.info.height,
            index: self.frames_read,
        };
        self.frames_read += 1;
        Ok(frame)
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() != self.video_stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("decoder send_packet")?;
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet from input"),
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        debug!(frames_read = self.frames_read, "released input video stream");
    }
}

#[cfg(target_os = "linux")]
const CAPTURE_BACKEND: Option<&str> = Some("video4linux2,v4l2");
#[cfg(target_os = "macos")]
const CAPTURE_BACKEND: Option<&str> = Some("avfoundation");
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const CAPTURE_BACKEND: Option<&str> = None;

fn open_camera(index: u32) -> Result<format::context::Input> {
    ffmpeg::device::register_all();
    let Some(backend) = CAPTURE_BACKEND else {
        bail!(ReframeError::CameraUnavailable(index));
    };

    let capture = ffmpeg::device::input::video()
        .find(|fmt| fmt.name() == backend)
        .ok_or(ReframeError::CameraUnavailable(index))?;

    let device = if cfg!(target_os = "linux") {
        format!("/dev/video{index}")
    } else {
        index.to_string()
    };

    match format::open_with(&device, &capture, Dictionary::new())
        .with_context(|| format!("could not open camera {index} ({device})"))?
    {
        format::context::Context::Input(ictx) => Ok(ictx),
        format::context::Context::Output(_) => bail!("camera {index} opened as an output"),
    }
}

fn rounded_fps(rate: Rational) -> u32 {
    if rate.denominator() == 0 || rate.numerator() <= 0 {
        return 0;
    }
    (rate.numerator() as f64 / rate.denominator() as f64).round() as u32
}

fn estimate_frames(stream: &format::stream::Stream<'_>) -> u64 {
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

// ── FFmpeg sink ──────────────────────────────────────────────────────────────

pub struct FfmpegSink {
    octx: format::context::Output,
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    spec: SinkSpec,
    frames_written: u64,
    frames_dropped: u64,
    finished: bool,
}

impl FfmpegSink {
    /// Open `output_path` for writing frames of exactly `spec.width × spec.height`.
    pub fn create<P: AsRef<Path>>(output_path: P, spec: SinkSpec, codec: OutputCodec) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let output_path = output_path.as_ref();

        let mut octx = format::output(&output_path)
            .with_context(|| format!("could not create output {}", output_path.display()))?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec.codec_id())
            .with_context(|| format!("{codec:?} encoder not found in this FFmpeg build"))?;

        let fps = spec.fps.max(1) as i32;
        let encoder_time_base = Rational::new(1, fps);

        let mut video_out_stream = octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;

        builder.set_width(spec.width);
        builder.set_height(spec.height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(encoder_time_base);
        builder.set_frame_rate(Some(Rational::new(fps, 1)));
        if codec == OutputCodec::Mp4v {
            // mpeg4 defaults to 200 kb/s, far too low for full-HD material
            let bit_rate = spec.width as usize * spec.height as usize * fps as usize / 4;
            builder.set_bit_rate(bit_rate.max(MIN_MPEG4_BIT_RATE));
        }
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(encoder_codec, codec.options())
            .with_context(|| format!("failed to open {codec:?} encoder"))?;

        video_out_stream.set_parameters(&video_encoder);
        video_out_stream.set_time_base(encoder_time_base);
        let stream_index = video_out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            spec.width,
            spec.height,
            ENCODE_FORMAT,
            spec.width,
            spec.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header().context("failed to write output header")?;
        let stream_time_base = octx
            .stream(stream_index)
            .context("output video stream vanished after header")?
            .time_base();

        info!(
            path = %output_path.display(),
            width = spec.width,
            height = spec.height,
            fps = spec.fps,
            ?codec,
            "opened output video"
        );

        Ok(Self {
            octx,
            video_encoder,
            to_yuv,
            out_rgb_frame: frame::Video::new(format::Pixel::RGB24, spec.width, spec.height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            encoder_time_base,
            stream_time_base,
            spec,
            frames_written: 0,
            frames_dropped: 0,
            finished: false,
        })
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain_encoder(&mut self) -> Result<()> {
        let mut encoded = Packet::empty();
        while self.video_encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.encoder_time_base, self.stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<WriteOutcome> {
        if self.finished {
            bail!("write to a finished output");
        }
        frame.check_buffer()?;
        // A writer opened at a fixed size cannot take other sizes; such frames
        // are dropped rather than rescaled.
        if frame.width != self.spec.width || frame.height != self.spec.height {
            self.frames_dropped += 1;
            warn!(
                frame = frame.index,
                frame_width = frame.width,
                frame_height = frame.height,
                out_width = self.spec.width,
                out_height = self.spec.height,
                "frame size differs from output size; frame dropped"
            );
            return Ok(WriteOutcome::Dropped);
        }

        let row_len = self.spec.width as usize * 3;
        let out_stride = self.out_rgb_frame.stride(0);
        let plane = self.out_rgb_frame.data_mut(0);
        for row in 0..self.spec.height as usize {
            let dst = row * out_stride;
            let src = row * row_len;
            plane[dst..dst + row_len].copy_from_slice(&frame.data[src..src + row_len]);
        }

        self.to_yuv
            .run(&self.out_rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.frames_written as i64));

        self.video_encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_encoder()?;

        self.frames_written += 1;
        if self.frames_written % 100 == 0 {
            debug!(frames_written = self.frames_written, "encoded frames");
        }
        Ok(WriteOutcome::Written)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.video_encoder.send_eof().context("encoder send_eof")?;
        self.drain_encoder()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;

        info!(
            frames_written = self.frames_written,
            frames_dropped = self.frames_dropped,
            "output video closed"
        );
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to close output video: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_buffer_length_is_validated() {
        assert!(RgbFrame::new(vec![0; 12], 2, 2, 0).is_ok());
        let err = RgbFrame::new(vec![0; 11], 2, 2, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReframeError>(),
            Some(ReframeError::FrameBufferSize { expected: 12, actual: 11, .. })
        ));
    }

    #[test]
    fn filled_frame_repeats_colour() {
        let frame = RgbFrame::filled(3, 2, [1, 2, 3], 7);
        assert_eq!(frame.data.len(), 18);
        assert!(frame.data.chunks_exact(3).all(|px| px == [1, 2, 3]));
        assert_eq!(frame.index, 7);
    }

    #[test]
    fn fps_is_rounded() {
        assert_eq!(rounded_fps(Rational::new(30000, 1001)), 30);
        assert_eq!(rounded_fps(Rational::new(25, 1)), 25);
        assert_eq!(rounded_fps(Rational::new(0, 0)), 0);
    }

    #[test]
    fn default_codec_is_mp4v() {
        assert_eq!(OutputCodec::default(), OutputCodec::Mp4v);
        assert_eq!(OutputCodec::H264.codec_id(), codec::Id::H264);
    }

    const SMALL: SinkSpec = SinkSpec {
        fps: 25,
        width: 32,
        height: 16,
    };

    fn read_all(path: &Path) -> (StreamInfo, Vec<RgbFrame>, FfmpegSource) {
        let mut source = FfmpegSource::open(&InputSource::File(path.to_path_buf())).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = source.read_frame().unwrap() {
            frames.push(frame);
        }
        (source.info(), frames, source)
    }

    #[test]
    fn sink_drops_mismatched_frames_and_source_reads_back_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small_out.mp4");

        let mut sink = FfmpegSink::create(&path, SMALL, OutputCodec::Mp4v).unwrap();
        let outcomes = [
            sink.write_frame(&RgbFrame::filled(32, 16, [200, 40, 40], 0)).unwrap(),
            sink.write_frame(&RgbFrame::filled(64, 32, [0, 0, 0], 1)).unwrap(),
            sink.write_frame(&RgbFrame::filled(32, 16, [40, 200, 40], 2)).unwrap(),
        ];
        assert_eq!(
            outcomes,
            [WriteOutcome::Written, WriteOutcome::Dropped, WriteOutcome::Written]
        );
        sink.finish().unwrap();
        sink.finish().unwrap();
        assert!(sink.write_frame(&RgbFrame::filled(32, 16, [0, 0, 0], 3)).is_err());
        drop(sink);

        let (info, frames, mut source) = read_all(&path);
        assert_eq!((info.width, info.height, info.fps), (32, 16, 25));
        assert_eq!(info.total_frames, 2);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1]);
        assert!(frames.iter().all(|f| f.data.len() == 32 * 16 * 3));
        // stays at end of stream
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn dropping_an_open_sink_finalises_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped_out.mp4");

        {
            let mut sink = FfmpegSink::create(&path, SMALL, OutputCodec::Mp4v).unwrap();
            for i in 0..4 {
                sink.write_frame(&RgbFrame::filled(32, 16, [90, 90, 90], i)).unwrap();
            }
        }

        let (_, frames, _) = read_all(&path);
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn malformed_frame_buffer_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FfmpegSink::create(dir.path().join("bad_out.mp4"), SMALL, OutputCodec::Mp4v).unwrap();

        let mut frame = RgbFrame::filled(32, 16, [0, 0, 0], 0);
        frame.data.truncate(100);
        let err = sink.write_frame(&frame).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReframeError>(),
            Some(ReframeError::FrameBufferSize { actual: 100, .. })
        ));
    }
}
