//! Encode worker: frames in, draw packets out.
//!
//! One worker task per window owns all codec state (the pipeline
//! manager and any transient picture encoders) and drains a work queue
//! fed by the scheduler. Cancellation is a shared watermark checked
//! before every expensive stage; an encoded packet is never retracted
//! though: the client may already depend on having received that frame.
//! The same rule extends to multi-part frames: once the first part is
//! out its flush countdown has promised the rest, so a cancellation
//! landing mid-plan no longer drops the remaining parts.
//! Everything the scheduler must track about a packet travels back as
//! [`WorkerEvent`]s instead of being written into shared state here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capability::{ClientCapabilities, CodecRegistry};
use crate::codec::{rgb, EncodeOutput};
use crate::encoding::Encoding;
use crate::error::BlitError;
use crate::flags::ClientFlags;
use crate::geometry::Rectangle;
use crate::packet::{options, DrawPacket};
use crate::pixels::{PixelFormat, WindowImage};
use crate::transport::{PacketSink, SendProgress};
use crate::window::pipeline::{PipelineManager, ScoreTargets};

// ── EncodeWork ───────────────────────────────────────────────────

/// One captured frame handed to the encode worker.
#[derive(Debug)]
pub struct EncodeWork {
    /// Capture sequence, shared by every packet made from this frame.
    /// The cancellation watermark is compared against it.
    pub sequence: u64,
    pub image: WindowImage,
    pub encoding: Encoding,
    /// When the damage event fired.
    pub damage_time: Instant,
    /// When the region left the batch queue and capture started.
    pub process_time: Instant,
    pub quality: u8,
    pub speed: u8,
    /// Tuning inputs for pipeline scoring.
    pub targets: ScoreTargets,
    /// Marks the lossless refresh pass; its acks clear the refresh
    /// region instead of re-arming the timer.
    pub auto_refresh: bool,
    /// Packets the client should wait for before painting, on top of
    /// whatever this frame itself splits into.
    pub flush: usize,
}

// ── WorkerEvent ──────────────────────────────────────────────────

/// Everything the scheduler needs to track one queued packet.
#[derive(Debug, Clone)]
pub struct PacketReport {
    /// Capture sequence of the work item this packet came from.
    pub sequence: u64,
    /// Per-packet transport sequence; the ack key.
    pub packet_sequence: u64,
    /// Encoding actually used (the encoder may substitute).
    pub encoding: Encoding,
    /// Output geometry, as the client will paint it.
    pub rect: Rectangle,
    pub damage_time: Instant,
    pub process_time: Instant,
    /// Frame index reported by stream encoders, when present.
    pub frame: Option<u64>,
    pub auto_refresh: bool,
    /// Decode hints that went out with the packet; the refresh logic
    /// inspects these for the effective lossless-ness.
    pub client_options: Map<String, Value>,
    /// Source pixels consumed, before any scaling.
    pub pixels: u64,
    pub bits_per_pixel: u8,
    pub compressed_size: usize,
    pub encode_secs: f64,
}

/// Progress reports from the encode worker back to the scheduler.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A packet was handed to the transport and must be tracked as
    /// pending an ack.
    Queued(Box<PacketReport>),
    /// All packets for one work item are out (or the item was
    /// dropped); the scheduler forgets its encoding-pending entry.
    Finished { sequence: u64 },
}

// ── EncodeWorker ─────────────────────────────────────────────────

/// Per-window encode task.
///
/// Owns the pipeline manager; the scheduler never touches a codec.
pub struct EncodeWorker {
    wid: u32,
    registry: Arc<CodecRegistry>,
    client: ClientCapabilities,
    pipelines: PipelineManager,
    sink: Arc<dyn PacketSink>,
    /// Highest cancelled capture sequence, shared with the scheduler.
    cancel: Arc<AtomicU64>,
    work: mpsc::Receiver<EncodeWork>,
    events: mpsc::Sender<WorkerEvent>,
    /// Handed to the sink with each packet so transport progress lands
    /// back on the scheduler.
    progress: mpsc::Sender<SendProgress>,
    packet_sequence: u64,
    send_timestamps: bool,
}

impl EncodeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wid: u32,
        registry: Arc<CodecRegistry>,
        client: ClientCapabilities,
        sink: Arc<dyn PacketSink>,
        cancel: Arc<AtomicU64>,
        work: mpsc::Receiver<EncodeWork>,
        events: mpsc::Sender<WorkerEvent>,
        progress: mpsc::Sender<SendProgress>,
    ) -> Self {
        let send_timestamps = client.flags.contains(ClientFlags::TIMESTAMPS);
        let pipelines = PipelineManager::new(registry.clone(), client.clone());
        Self {
            wid,
            registry,
            client,
            pipelines,
            sink,
            cancel,
            work,
            events,
            progress,
            packet_sequence: 0,
            send_timestamps,
        }
    }

    /// Drain the work queue until the scheduler drops its sender.
    pub async fn run(mut self) {
        debug!(wid = self.wid, "encode worker running");
        while let Some(work) = self.work.recv().await {
            let sequence = work.sequence;
            self.handle(work).await;
            if self
                .events
                .send(WorkerEvent::Finished { sequence })
                .await
                .is_err()
            {
                break;
            }
        }
        self.pipelines.clean();
        debug!(wid = self.wid, "encode worker stopped");
    }

    fn cancelled(&self, sequence: u64) -> bool {
        self.cancel.load(Ordering::Acquire) >= sequence
    }

    async fn handle(&mut self, work: EncodeWork) {
        let EncodeWork {
            sequence,
            image,
            encoding,
            damage_time,
            process_time,
            quality,
            speed,
            targets,
            auto_refresh,
            flush,
        } = work;
        if self.cancelled(sequence) {
            debug!(wid = self.wid, sequence, "frame cancelled before encode");
            return;
        }

        // A pipeline encoding only covers mask-rounded dimensions; the
        // leftover right/bottom strips go out first as raw rgb and the
        // client assembles the full rectangle on the final flush.
        let mut parts: Vec<(WindowImage, Encoding)> = Vec::new();
        if encoding.uses_pipeline() {
            let ow = image.width;
            let oh = image.height;
            let w = ow & self.pipelines.width_mask;
            let h = oh & self.pipelines.height_mask;
            let ee = edge_encoding(&image);
            if ow > w && h > 0 {
                if let Some(sub) = image.sub_image(image.x + w as i32, image.y, ow - w, oh) {
                    parts.push((sub, ee));
                }
            }
            if oh > h && w > 0 {
                if let Some(sub) = image.sub_image(image.x, image.y + h as i32, ow, oh - h) {
                    parts.push((sub, ee));
                }
            }
            if w > 0 && h > 0 {
                if (w, h) == (ow, oh) {
                    parts.push((image, encoding));
                } else if let Some(main) = image.sub_image(image.x, image.y, w, h) {
                    parts.push((main, encoding));
                } else {
                    // planar capture, cannot crop; let the pipeline cope
                    parts.push((image, encoding));
                }
            }
        } else {
            parts.push((image, encoding));
        }

        // The flush countdown must end at 0 on the last part.
        let flush = flush.max(parts.len().saturating_sub(1));
        let mut delivered = 0usize;
        for (i, (part, coding)) in parts.into_iter().enumerate() {
            // A delivered part promised `flush - i` more packets, so
            // cancellation may only drop plans that have not started
            // going out; after the first part, the whole plan ships.
            if delivered == 0 && self.cancelled(sequence) {
                debug!(wid = self.wid, sequence, "frame cancelled before any part went out");
                return;
            }
            let t0 = Instant::now();
            match self.compress(t0, &part, coding, quality, speed, &targets) {
                Ok(Some(out)) => {
                    let encode_secs = t0.elapsed().as_secs_f64();
                    // Cancelled or not, an encoded packet goes out: the
                    // client may depend on having received this frame.
                    if self
                        .deliver(
                            sequence,
                            &part,
                            out,
                            damage_time,
                            process_time,
                            auto_refresh,
                            flush - i,
                            encode_secs,
                        )
                        .await
                        .is_err()
                    {
                        return;
                    }
                    delivered += 1;
                }
                Ok(None) => {
                    debug!(
                        wid = self.wid,
                        sequence,
                        encoding = %coding,
                        "encoder had no output for this frame"
                    );
                }
                Err(e) => {
                    warn!(
                        wid = self.wid,
                        sequence,
                        encoding = %coding,
                        error = %e,
                        "encode failed, dropping this part"
                    );
                }
            }
        }
    }

    /// Route one image to the matching compression path.
    fn compress(
        &mut self,
        now: Instant,
        image: &WindowImage,
        encoding: Encoding,
        quality: u8,
        speed: u8,
        targets: &ScoreTargets,
    ) -> Result<Option<EncodeOutput>, BlitError> {
        match encoding {
            Encoding::Rgb24 | Encoding::Rgb32 => rgb::encode(encoding, image, speed).map(Some),
            e if e.uses_pipeline() => {
                self.pipelines
                    .maybe_recheck(now, e, image.width, image.height, image.format, targets);
                match self.pipelines.ensure(
                    now,
                    e,
                    image.width,
                    image.height,
                    image.format,
                    quality,
                    speed,
                    targets,
                ) {
                    Ok(()) => self.pipelines.process(image, quality, speed),
                    Err(err @ BlitError::PipelineExhausted { .. }) => {
                        // degrade, don't drop the frame
                        warn!(
                            wid = self.wid,
                            error = %err,
                            "no usable pipeline, sending raw rgb instead"
                        );
                        rgb::encode(edge_encoding(image), image, speed).map(Some)
                    }
                    Err(err) => Err(err),
                }
            }
            e => self.compress_simple(image, e, quality, speed),
        }
    }

    /// Stateless picture path: a fresh encoder instance per frame,
    /// first registry entry that takes the geometry wins.
    fn compress_simple(
        &self,
        image: &WindowImage,
        encoding: Encoding,
        quality: u8,
        speed: u8,
    ) -> Result<Option<EncodeOutput>, BlitError> {
        let dst_formats = self.client.dst_formats(encoding);
        for entry in self.registry.encoders_for(encoding, image.format) {
            if !entry.spec.can_handle(image.width, image.height) {
                continue;
            }
            let Some(_guard) = entry.try_acquire() else {
                continue;
            };
            let mut enc = entry.factory.make_instance();
            if let Err(e) = enc.init_context(
                image.width,
                image.height,
                image.format,
                dst_formats,
                encoding,
                quality,
                speed,
            ) {
                warn!(
                    wid = self.wid,
                    encoder = entry.name,
                    error = %e,
                    "picture encoder init failed, trying next"
                );
                enc.clean();
                continue;
            }
            let out = enc.compress_image(image, quality, speed);
            enc.clean();
            match out {
                Ok(res) => return Ok(res),
                Err(e) => {
                    warn!(
                        wid = self.wid,
                        encoder = entry.name,
                        error = %e,
                        "picture encode failed, trying next"
                    );
                }
            }
        }
        // No codec takes this one; raw rgb keeps the frame moving.
        let fallback = edge_encoding(image);
        debug!(
            wid = self.wid,
            requested = %encoding,
            fallback = %fallback,
            "no picture encoder available, sending raw rgb"
        );
        rgb::encode(fallback, image, speed).map(Some)
    }

    /// Build the draw packet, report it, queue it on the transport.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &mut self,
        sequence: u64,
        image: &WindowImage,
        out: EncodeOutput,
        damage_time: Instant,
        process_time: Instant,
        auto_refresh: bool,
        flush: usize,
        encode_secs: f64,
    ) -> Result<(), BlitError> {
        let mut client_options = out.client_options;
        if flush > 0 && self.client.flags.contains(ClientFlags::FLUSH) {
            client_options.insert(options::FLUSH.into(), Value::from(flush as u64));
        }
        if self.send_timestamps {
            let age_ms = image.timestamp.elapsed().as_millis() as u64;
            client_options.insert(options::TIMESTAMP.into(), Value::from(age_ms));
        }
        let frame = client_options.get(options::FRAME).and_then(Value::as_u64);

        self.packet_sequence += 1;
        let packet = DrawPacket {
            window_id: self.wid,
            x: image.x,
            y: image.y,
            width: out.width,
            height: out.height,
            encoding: out.encoding,
            data: out.data.to_vec(),
            sequence: self.packet_sequence,
            rowstride: out.stride,
            client_options: client_options.clone(),
        };
        let report = PacketReport {
            sequence,
            packet_sequence: self.packet_sequence,
            encoding: out.encoding,
            rect: Rectangle::new(image.x, image.y, out.width as i32, out.height as i32),
            damage_time,
            process_time,
            frame,
            auto_refresh,
            client_options,
            pixels: image.pixel_count(),
            bits_per_pixel: out.bits_per_pixel,
            compressed_size: packet.data.len(),
            encode_secs,
        };
        debug!(
            wid = self.wid,
            sequence,
            packet_sequence = self.packet_sequence,
            encoding = %report.encoding,
            w = out.width,
            h = out.height,
            bytes = report.compressed_size,
            flush,
            "draw packet ready"
        );
        // The pending-ack entry must be on its way to the scheduler
        // before the transport can report progress for this packet.
        self.events.send(WorkerEvent::Queued(Box::new(report))).await?;
        if let Err(e) = self.sink.queue_packet(packet, self.progress.clone()).await {
            warn!(wid = self.wid, error = %e, "transport refused the packet");
        }
        Ok(())
    }
}

/// Raw-rgb flavour for edge strips and fallbacks: rgb32 whenever the
/// format carries alpha or deep colour, rgb24 otherwise.
fn edge_encoding(image: &WindowImage) -> Encoding {
    if image.format == PixelFormat::R210 || image.format.has_alpha() {
        Encoding::Rgb32
    } else {
        Encoding::Rgb24
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySpec;
    use crate::codec::{EncoderFactory, PixelEncoder};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn bgrx(x: i32, y: i32, w: u32, h: u32) -> WindowImage {
        let data = vec![0x40u8; (w * h * 4) as usize];
        WindowImage::packed(x, y, w, h, PixelFormat::Bgrx8, Bytes::from(data), w * 4)
    }

    fn work(sequence: u64, image: WindowImage, encoding: Encoding) -> EncodeWork {
        let now = Instant::now();
        EncodeWork {
            sequence,
            image,
            encoding,
            damage_time: now,
            process_time: now,
            quality: 50,
            speed: 50,
            targets: ScoreTargets {
                target_quality: 50,
                min_quality: 0,
                target_speed: 50,
                min_speed: 0,
            },
            auto_refresh: false,
            flush: 0,
        }
    }

    #[derive(Default)]
    struct CollectSink {
        sent: Mutex<Vec<DrawPacket>>,
    }

    #[async_trait]
    impl PacketSink for CollectSink {
        async fn queue_packet(
            &self,
            packet: DrawPacket,
            progress: mpsc::Sender<SendProgress>,
        ) -> Result<(), BlitError> {
            let sequence = packet.sequence;
            let bytes = packet.data.len() as u64;
            self.sent.lock().unwrap().push(packet);
            let _ = progress.send(SendProgress::Started { sequence, bytes: 0 }).await;
            let _ = progress.send(SendProgress::Completed { sequence, bytes }).await;
            Ok(())
        }
    }

    struct Rig {
        work: mpsc::Sender<EncodeWork>,
        events: mpsc::Receiver<WorkerEvent>,
        progress: mpsc::Receiver<SendProgress>,
        cancel: Arc<AtomicU64>,
        sink: Arc<CollectSink>,
    }

    fn rig(registry: Arc<CodecRegistry>, client: ClientCapabilities) -> Rig {
        let (work_tx, work_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let cancel = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(CollectSink::default());
        let worker = EncodeWorker::new(
            1,
            registry,
            client,
            sink.clone(),
            cancel.clone(),
            work_rx,
            event_tx,
            progress_tx,
        );
        tokio::spawn(worker.run());
        Rig {
            work: work_tx,
            events: event_rx,
            progress: progress_rx,
            cancel,
            sink,
        }
    }

    fn queued(event: Option<WorkerEvent>) -> PacketReport {
        match event {
            Some(WorkerEvent::Queued(report)) => *report,
            other => panic!("expected a queued packet, got {other:?}"),
        }
    }

    fn finished(event: Option<WorkerEvent>) -> u64 {
        match event {
            Some(WorkerEvent::Finished { sequence }) => sequence,
            other => panic!("expected a finished item, got {other:?}"),
        }
    }

    // A video-style encoder: remembers its init geometry, numbers the
    // frames it compresses.
    struct StreamEncoder {
        encoding: Encoding,
        src: PixelFormat,
        dims: (u32, u32),
        frame: u64,
    }

    impl PixelEncoder for StreamEncoder {
        fn init_context(
            &mut self,
            width: u32,
            height: u32,
            src_format: PixelFormat,
            _dst_formats: &[PixelFormat],
            encoding: Encoding,
            _quality: u8,
            _speed: u8,
        ) -> Result<(), BlitError> {
            self.dims = (width, height);
            self.src = src_format;
            self.encoding = encoding;
            Ok(())
        }

        fn compress_image(
            &mut self,
            _image: &WindowImage,
            _quality: u8,
            _speed: u8,
        ) -> Result<Option<EncodeOutput>, BlitError> {
            let mut client_options = Map::new();
            client_options.insert(options::FRAME.into(), Value::from(self.frame));
            self.frame += 1;
            Ok(Some(EncodeOutput {
                encoding: self.encoding,
                data: Bytes::from_static(b"stream"),
                client_options,
                width: self.dims.0,
                height: self.dims.1,
                stride: 0,
                bits_per_pixel: 24,
            }))
        }

        fn encoding(&self) -> Encoding {
            self.encoding
        }

        fn src_format(&self) -> PixelFormat {
            self.src
        }

        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }

        fn clean(&mut self) {}
    }

    struct StreamFactory;

    impl EncoderFactory for StreamFactory {
        fn make_instance(&self) -> Box<dyn PixelEncoder> {
            Box::new(StreamEncoder {
                encoding: Encoding::Vp8,
                src: PixelFormat::Bgrx8,
                dims: (0, 0),
                frame: 0,
            })
        }
    }

    // A one-shot picture encoder, counting instantiations.
    struct PictureEncoder {
        encoding: Encoding,
        src: PixelFormat,
        dims: (u32, u32),
    }

    impl PixelEncoder for PictureEncoder {
        fn init_context(
            &mut self,
            width: u32,
            height: u32,
            src_format: PixelFormat,
            _dst_formats: &[PixelFormat],
            encoding: Encoding,
            _quality: u8,
            _speed: u8,
        ) -> Result<(), BlitError> {
            self.dims = (width, height);
            self.src = src_format;
            self.encoding = encoding;
            Ok(())
        }

        fn compress_image(
            &mut self,
            image: &WindowImage,
            _quality: u8,
            _speed: u8,
        ) -> Result<Option<EncodeOutput>, BlitError> {
            Ok(Some(EncodeOutput {
                encoding: self.encoding,
                data: Bytes::from_static(b"picture"),
                client_options: Map::new(),
                width: image.width,
                height: image.height,
                stride: 0,
                bits_per_pixel: 24,
            }))
        }

        fn encoding(&self) -> Encoding {
            self.encoding
        }

        fn src_format(&self) -> PixelFormat {
            self.src
        }

        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }

        fn clean(&mut self) {}
    }

    struct PictureFactory {
        made: Arc<AtomicUsize>,
    }

    impl EncoderFactory for PictureFactory {
        fn make_instance(&self) -> Box<dyn PixelEncoder> {
            self.made.fetch_add(1, Ordering::AcqRel);
            Box::new(PictureEncoder {
                encoding: Encoding::Png,
                src: PixelFormat::Bgrx8,
                dims: (0, 0),
            })
        }
    }

    #[tokio::test]
    async fn rgb_frame_reaches_the_sink() {
        let mut r = rig(Arc::new(CodecRegistry::default()), ClientCapabilities::default());
        r.work.send(work(1, bgrx(5, 7, 4, 3), Encoding::Rgb24)).await.unwrap();

        let report = queued(r.events.recv().await);
        assert_eq!(report.sequence, 1);
        assert_eq!(report.packet_sequence, 1);
        assert_eq!(report.encoding, Encoding::Rgb24);
        assert_eq!(report.rect, Rectangle::new(5, 7, 4, 3));
        assert_eq!(report.pixels, 12);
        assert_eq!(finished(r.events.recv().await), 1);

        let sent = r.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].window_id, 1);
        assert_eq!((sent[0].x, sent[0].y), (5, 7));
        assert_eq!(sent[0].sequence, 1);
        // no flush option on a single-packet frame
        assert!(!sent[0].client_options.contains_key(options::FLUSH));
        drop(sent);

        // transport progress flows through the worker's sender
        assert!(matches!(
            r.progress.recv().await,
            Some(SendProgress::Started { sequence: 1, .. })
        ));
        assert!(matches!(
            r.progress.recv().await,
            Some(SendProgress::Completed { sequence: 1, .. })
        ));
    }

    #[tokio::test]
    async fn watermark_drops_only_older_sequences() {
        let mut r = rig(Arc::new(CodecRegistry::default()), ClientCapabilities::default());
        r.cancel.store(5, Ordering::Release);

        r.work.send(work(5, bgrx(0, 0, 4, 4), Encoding::Rgb24)).await.unwrap();
        assert_eq!(finished(r.events.recv().await), 5);
        assert!(r.sink.sent.lock().unwrap().is_empty());

        r.work.send(work(6, bgrx(0, 0, 4, 4), Encoding::Rgb24)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert_eq!(report.sequence, 6);
        assert_eq!(finished(r.events.recv().await), 6);
        assert_eq!(r.sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn edge_strips_carry_the_flush_countdown() {
        let spec = CapabilitySpec {
            width_mask: 0xFFF0,
            height_mask: 0xFFF0,
            ..Default::default()
        };
        let registry = CodecRegistry::builder()
            .encoder("fake-vp8", Encoding::Vp8, PixelFormat::Bgrx8, spec, Arc::new(StreamFactory))
            .build();
        let mut client = ClientCapabilities::default();
        client.csc_modes.insert(Encoding::Vp8, vec![PixelFormat::Bgrx8]);
        let mut r = rig(registry, client);

        // First frame: the manager masks are still wide open, so no
        // strips yet; the pipeline is set up with masked dimensions.
        r.work.send(work(1, bgrx(0, 0, 20, 20), Encoding::Vp8)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert_eq!(report.encoding, Encoding::Vp8);
        assert_eq!(report.rect, Rectangle::new(0, 0, 16, 16));
        assert_eq!(report.frame, Some(0));
        assert_eq!(finished(r.events.recv().await), 1);

        // Second frame: the live masks split off the 4px strips.
        r.work.send(work(2, bgrx(0, 0, 20, 20), Encoding::Vp8)).await.unwrap();

        let right = queued(r.events.recv().await);
        assert_eq!(right.encoding, Encoding::Rgb24);
        assert_eq!(right.rect, Rectangle::new(16, 0, 4, 20));
        assert_eq!(right.packet_sequence, 2);
        assert_eq!(right.client_options[options::FLUSH], Value::from(2u64));

        let bottom = queued(r.events.recv().await);
        assert_eq!(bottom.encoding, Encoding::Rgb24);
        assert_eq!(bottom.rect, Rectangle::new(0, 16, 20, 4));
        assert_eq!(bottom.packet_sequence, 3);
        assert_eq!(bottom.client_options[options::FLUSH], Value::from(1u64));

        let main = queued(r.events.recv().await);
        assert_eq!(main.encoding, Encoding::Vp8);
        assert_eq!(main.rect, Rectangle::new(0, 0, 16, 16));
        assert_eq!(main.packet_sequence, 4);
        // same pipeline instance, so the frame counter carried on
        assert_eq!(main.frame, Some(1));
        assert!(!main.client_options.contains_key(options::FLUSH));
        assert_eq!(finished(r.events.recv().await), 2);

        assert_eq!(r.sink.sent.lock().unwrap().len(), 4);
    }

    /// Sink that publishes the cancellation watermark as soon as it
    /// sees a packet carrying a flush promise.
    struct CancelOnFlushSink {
        cancel: Arc<AtomicU64>,
        watermark: u64,
        sent: Mutex<Vec<DrawPacket>>,
    }

    #[async_trait]
    impl PacketSink for CancelOnFlushSink {
        async fn queue_packet(
            &self,
            packet: DrawPacket,
            _progress: mpsc::Sender<SendProgress>,
        ) -> Result<(), BlitError> {
            if packet.client_options.contains_key(options::FLUSH) {
                self.cancel.store(self.watermark, Ordering::Release);
            }
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_mid_plan_still_completes_the_flush_countdown() {
        let spec = CapabilitySpec {
            width_mask: 0xFFF0,
            height_mask: 0xFFF0,
            ..Default::default()
        };
        let registry = CodecRegistry::builder()
            .encoder("fake-vp8", Encoding::Vp8, PixelFormat::Bgrx8, spec, Arc::new(StreamFactory))
            .build();
        let mut client = ClientCapabilities::default();
        client.csc_modes.insert(Encoding::Vp8, vec![PixelFormat::Bgrx8]);

        let (work_tx, work_rx) = mpsc::channel(16);
        let (event_tx, mut events) = mpsc::channel(16);
        let (progress_tx, _progress_rx) = mpsc::channel(64);
        let cancel = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(CancelOnFlushSink {
            cancel: cancel.clone(),
            watermark: 2,
            sent: Mutex::new(Vec::new()),
        });
        let worker = EncodeWorker::new(
            1,
            registry,
            client,
            sink.clone(),
            cancel,
            work_rx,
            event_tx,
            progress_tx,
        );
        tokio::spawn(worker.run());

        // First frame sizes the masks; single part, no flush promise.
        work_tx.send(work(1, bgrx(0, 0, 20, 20), Encoding::Vp8)).await.unwrap();
        let _ = queued(events.recv().await);
        assert_eq!(finished(events.recv().await), 1);

        // Second frame splits into three parts. The sink cancels the
        // frame the moment the first part (flush = 2) goes out; the
        // two promised packets must still follow.
        work_tx.send(work(2, bgrx(0, 0, 20, 20), Encoding::Vp8)).await.unwrap();
        let first = queued(events.recv().await);
        assert_eq!(first.client_options[options::FLUSH], Value::from(2u64));
        let second = queued(events.recv().await);
        assert_eq!(second.client_options[options::FLUSH], Value::from(1u64));
        let last = queued(events.recv().await);
        assert!(!last.client_options.contains_key(options::FLUSH));
        assert_eq!(finished(events.recv().await), 2);
        assert_eq!(sink.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn pipeline_exhausted_falls_back_to_rgb() {
        // The client wants vp8 but the registry has no encoder at all.
        let mut client = ClientCapabilities::default();
        client.csc_modes.insert(Encoding::Vp8, vec![PixelFormat::Bgrx8]);
        let mut r = rig(Arc::new(CodecRegistry::default()), client);

        r.work.send(work(1, bgrx(0, 0, 8, 8), Encoding::Vp8)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert_eq!(report.encoding, Encoding::Rgb24);
        assert_eq!(report.client_options[options::LOSSLESS], Value::from(true));
        assert_eq!(finished(r.events.recv().await), 1);
    }

    #[tokio::test]
    async fn picture_encoders_are_acquired_per_frame() {
        let made = Arc::new(AtomicUsize::new(0));
        let registry = CodecRegistry::builder()
            .encoder(
                "fake-png",
                Encoding::Png,
                PixelFormat::Bgrx8,
                CapabilitySpec::default(),
                Arc::new(PictureFactory { made: made.clone() }),
            )
            .build();
        let mut r = rig(registry.clone(), ClientCapabilities::default());

        for seq in 1..=2u64 {
            r.work.send(work(seq, bgrx(0, 0, 6, 6), Encoding::Png)).await.unwrap();
            let report = queued(r.events.recv().await);
            assert_eq!(report.encoding, Encoding::Png);
            assert_eq!(finished(r.events.recv().await), seq);
        }
        // a fresh instance each frame, and every slot released
        assert_eq!(made.load(Ordering::Acquire), 2);
        assert_eq!(registry.encoders()[0].live_instances(), 0);
    }

    #[tokio::test]
    async fn missing_picture_encoder_degrades_to_rgb() {
        let mut r = rig(Arc::new(CodecRegistry::default()), ClientCapabilities::default());
        r.work.send(work(1, bgrx(0, 0, 6, 6), Encoding::Png)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert_eq!(report.encoding, Encoding::Rgb24);
        assert_eq!(report.client_options[options::LOSSLESS], Value::from(true));
        assert_eq!(finished(r.events.recv().await), 1);
    }

    #[tokio::test]
    async fn timestamps_follow_the_client_flag() {
        let mut with = ClientCapabilities::default();
        with.flags |= ClientFlags::TIMESTAMPS;
        let mut r = rig(Arc::new(CodecRegistry::default()), with);
        r.work.send(work(1, bgrx(0, 0, 4, 4), Encoding::Rgb24)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert!(report.client_options.contains_key(options::TIMESTAMP));

        let mut r = rig(Arc::new(CodecRegistry::default()), ClientCapabilities::default());
        r.work.send(work(1, bgrx(0, 0, 4, 4), Encoding::Rgb24)).await.unwrap();
        let report = queued(r.events.recv().await);
        assert!(!report.client_options.contains_key(options::TIMESTAMP));
    }

    #[test]
    fn edge_strips_keep_alpha_and_deep_colour() {
        let plain = bgrx(0, 0, 2, 2);
        assert_eq!(edge_encoding(&plain), Encoding::Rgb24);

        let alpha = WindowImage::packed(
            0,
            0,
            2,
            2,
            PixelFormat::Bgra8,
            Bytes::from(vec![0u8; 16]),
            8,
        );
        assert_eq!(edge_encoding(&alpha), Encoding::Rgb32);

        let deep = WindowImage::packed(
            0,
            0,
            2,
            2,
            PixelFormat::R210,
            Bytes::from(vec![0u8; 16]),
            8,
        );
        assert_eq!(edge_encoding(&deep), Encoding::Rgb32);
    }
}
