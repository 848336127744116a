//! Pipeline runner: capture front ends, the encoder worker, lifecycle.
//!
//! Device callbacks call [`AudioInputPipeline::add_mic`] and
//! [`AudioInputPipeline::add_echo`] from their own threads. Each call runs the
//! mixer and resampler front end in place and forwards whole codec-rate
//! frames: mic frames either pair up with loopback frames in the
//! resynchronizer or travel straight to the worker thread, which owns all DSP,
//! codec and packet state.
//!
//! Reconfiguration is rebuild: drop the pipeline (which joins the worker after
//! draining in-flight frames) and construct a new one. Only the DSP tunables
//! exposed below change at runtime, through the processor reset latch.

use crate::bandwidth::{adjust_bandwidth, BandwidthBudget};
use crate::codec::{CodecRegistry, CodecStage, ServerCodecInfo};
use crate::config::{
    EchoCancelMode, InputConfig, NetworkConfig, NoiseCancelMode, StreamSpec,
};
use crate::controls::{Controls, ControlsSnapshot};
use crate::dsp::{DspChain, DspTunables};
use crate::error::AudioInputError;
use crate::events::InputEvent;
use crate::gate::VoiceGate;
use crate::levels::LevelMeter;
use crate::mixer::{AccumulatorMode, FrameAccumulator};
use crate::packet::{DeliveryContext, PacketAssembler};
use crate::resample::ResamplerStage;
use crate::resync::{AudioChunk, Frame, Resynchronizer};
use crate::sink::InputSinks;
use crate::{FRAME_SIZE, SAMPLE_RATE};
use bytes::Bytes;
use clamor_protocol::audio::AudioCodec;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::instrument;

/// Frames the worker may fall behind before capture callbacks start dropping.
const CHUNK_QUEUE_CAPACITY: usize = 256;

struct Shared {
    running: AtomicBool,
    transmitting: AtomicBool,
    reset_processor: AtomicBool,
    tunables: Mutex<DspTunables>,
    budget: Mutex<BandwidthBudget>,
}

/// Mixer + resampler front end of one capture stream. Confined to the thread
/// delivering that stream's callbacks; the mutex only serialises against
/// overlapping callbacks from a restarting device.
struct StreamFrontEnd {
    acc: FrameAccumulator,
    resampler: ResamplerStage,
    resampled: Vec<f32>,
}

impl StreamFrontEnd {
    fn new(
        spec: StreamSpec,
        mode: AccumulatorMode,
        out_channels: u32,
    ) -> Result<Self, AudioInputError> {
        let device_frame = (FRAME_SIZE * spec.sample_rate as usize) / SAMPLE_RATE as usize;
        Ok(Self {
            acc: FrameAccumulator::new(spec, device_frame, mode),
            resampler: ResamplerStage::new(out_channels, spec.sample_rate, SAMPLE_RATE)?,
            resampled: vec![0.0; FRAME_SIZE * out_channels as usize],
        })
    }

    fn push(&mut self, data: &[u8], samples: usize, mut emit: impl FnMut(Frame)) {
        let Self {
            acc,
            resampler,
            resampled,
        } = self;

        acc.push(data, samples, |device_frame| {
            resampled.fill(0.0);
            match resampler.process(device_frame, resampled) {
                Ok(_) => emit(
                    resampled
                        .iter()
                        .map(|&v| (v * 32768.0).clamp(-32768.0, 32767.0) as i16)
                        .collect(),
                ),
                Err(err) => tracing::warn!(%err, "resampler failed, dropping frame"),
            }
        });
    }
}

pub struct AudioInputPipeline {
    config: InputConfig,
    controls: Arc<Controls>,
    levels: Arc<LevelMeter>,
    shared: Arc<Shared>,
    resync: Arc<Resynchronizer>,
    events_tx: Sender<InputEvent>,
    mic: Mutex<StreamFrontEnd>,
    echo: Option<Mutex<StreamFrontEnd>>,
    chunk_tx: Option<Sender<AudioChunk>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioInputPipeline {
    /// Builds the pipeline and spawns its worker thread. The returned
    /// receiver carries every [`InputEvent`] for the UI collaborator.
    #[instrument(skip_all, err)]
    pub fn new(
        config: InputConfig,
        mic_spec: StreamSpec,
        echo_spec: Option<StreamSpec>,
        server: ServerCodecInfo,
        registry: CodecRegistry,
        sinks: InputSinks,
    ) -> Result<(Self, Receiver<InputEvent>), AudioInputError> {
        validate_spec(&mic_spec)?;
        if let Some(spec) = &echo_spec {
            validate_spec(spec)?;
        }

        let (events_tx, events_rx) = unbounded();

        let budget = adjust_bandwidth(&config.network, &config.quality);
        if budget.bitrate != config.quality.quality
            || budget.frames_per_packet != config.quality.frames_per_packet
        {
            tracing::warn!(
                cap = config.network.max_bandwidth,
                bitrate = budget.bitrate,
                frames = budget.frames_per_packet,
                "audio quality auto-adjusted to fit the server bandwidth cap"
            );
            let _ = events_tx.send(InputEvent::BandwidthAdjusted {
                bitrate: budget.bitrate,
                frames_per_packet: budget.frames_per_packet,
            });
        }

        let echo_active =
            echo_spec.is_some() && config.dsp.echo_cancel_mode != EchoCancelMode::Disabled;
        let echo_channels = match (&echo_spec, config.dsp.echo_cancel_mode) {
            (Some(spec), EchoCancelMode::Multichannel) => spec.channels,
            (Some(_), EchoCancelMode::Mixed) => 1,
            _ => 0,
        };

        let controls = Arc::new(Controls::new(config.gate.double_push_window));
        let levels = Arc::new(LevelMeter::default());
        let resync = Arc::new(Resynchronizer::new());

        let tunables = DspTunables {
            noise_cancel: config.dsp.noise_cancel_mode,
            min_loudness: config.dsp.min_loudness,
            noise_suppress: config.dsp.noise_suppress,
        };
        let dsp = DspChain::new(
            tunables,
            FRAME_SIZE,
            SAMPLE_RATE,
            echo_channels,
            resync.nominal_lag(),
        )?
        .with_levels(levels.clone());

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            transmitting: AtomicBool::new(false),
            reset_processor: AtomicBool::new(false),
            tunables: Mutex::new(tunables),
            budget: Mutex::new(budget),
        });

        let mic = Mutex::new(StreamFrontEnd::new(mic_spec, AccumulatorMode::Mixdown, 1)?);
        let echo = match (&echo_spec, echo_active) {
            (Some(spec), true) => {
                let (mode, channels) = match config.dsp.echo_cancel_mode {
                    EchoCancelMode::Multichannel => (AccumulatorMode::Interleaved, spec.channels),
                    _ => (AccumulatorMode::Mixdown, 1),
                };
                Some(Mutex::new(StreamFrontEnd::new(*spec, mode, channels)?))
            }
            _ => None,
        };

        let gate = VoiceGate::new(
            config.gate.clone(),
            config.loopback_mode,
            server.session_active,
        );

        let (chunk_tx, chunk_rx) = bounded(CHUNK_QUEUE_CAPACITY);

        let worker = InputWorker {
            config: config.clone(),
            server,
            registry,
            sinks,
            events: events_tx.clone(),
            controls: controls.clone(),
            levels: levels.clone(),
            shared: shared.clone(),
            resync: resync.clone(),
            echo_channels,
            dsp,
            gate,
            codec: CodecStage::new(),
            assembler: PacketAssembler::new(),
            opus_pcm: Vec::with_capacity(FRAME_SIZE * 8),
        };
        let handle = std::thread::Builder::new()
            .name("clamor-audio-input".into())
            .spawn(move || worker.run(chunk_rx))?;

        tracing::debug!(
            mic = ?mic_spec,
            echo = ?echo_spec,
            echo_channels,
            bitrate = budget.bitrate,
            frames_per_packet = budget.frames_per_packet,
            "audio input pipeline started"
        );

        Ok((
            Self {
                config,
                controls,
                levels,
                shared,
                resync,
                events_tx,
                mic,
                echo,
                chunk_tx: Some(chunk_tx),
                worker: Some(handle),
            },
            events_rx,
        ))
    }

    /// Feeds `samples` interleaved sample frames of raw microphone PCM.
    /// Called from the mic capture thread.
    pub fn add_mic(&self, data: &[u8], samples: usize) {
        let Some(tx) = &self.chunk_tx else { return };
        let echo_active = self.echo.is_some();
        let resync = &self.resync;

        self.mic.lock().push(data, samples, |frame| {
            if echo_active {
                resync.add_mic(frame);
            } else {
                send_chunk(tx, AudioChunk::mic_only(frame));
            }
        });
    }

    /// Feeds `samples` interleaved sample frames of speaker loopback PCM.
    /// Called from the loopback capture thread. Ignored while echo
    /// cancellation is disabled.
    pub fn add_echo(&self, data: &[u8], samples: usize) {
        let Some(front) = &self.echo else { return };
        let Some(tx) = &self.chunk_tx else { return };
        let resync = &self.resync;

        front.lock().push(data, samples, |frame| {
            if let Some(chunk) = resync.add_speaker(frame) {
                send_chunk(tx, chunk);
            }
        });
    }

    pub fn controls(&self) -> Arc<Controls> {
        self.controls.clone()
    }

    pub fn levels(&self) -> Arc<LevelMeter> {
        self.levels.clone()
    }

    pub fn is_transmitting(&self) -> bool {
        self.shared.transmitting.load(Ordering::Relaxed)
    }

    /// Switches the noise canceller; takes effect at the next frame boundary
    /// through the processor reset latch.
    pub fn set_noise_cancel_mode(&self, mode: NoiseCancelMode) {
        self.shared.tunables.lock().noise_cancel = mode;
        self.shared.reset_processor.store(true, Ordering::Relaxed);
    }

    /// Adjusts the AGC max-gain anchor; takes effect at the next frame
    /// boundary through the processor reset latch.
    pub fn set_min_loudness(&self, min_loudness: i32) {
        self.shared.tunables.lock().min_loudness = min_loudness;
        self.shared.reset_processor.store(true, Ordering::Relaxed);
    }

    /// Applies a new server bandwidth cap to the running pipeline.
    pub fn set_max_bandwidth(&self, bits_per_sec: i32) {
        let net = NetworkConfig {
            max_bandwidth: bits_per_sec,
            ..self.config.network.clone()
        };
        let budget = adjust_bandwidth(&net, &self.config.quality);

        let changed = {
            let mut current = self.shared.budget.lock();
            let changed = *current != budget;
            *current = budget;
            changed
        };
        if changed
            && (budget.bitrate != self.config.quality.quality
                || budget.frames_per_packet != self.config.quality.frames_per_packet)
        {
            let _ = self.events_tx.send(InputEvent::BandwidthAdjusted {
                bitrate: budget.bitrate,
                frames_per_packet: budget.frames_per_packet,
            });
        }
    }

    /// External shutdown flag: the worker drops every remaining frame at
    /// encode entry and the next drop/`shutdown` returns promptly.
    pub fn halt(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    /// Stops the pipeline, draining frames already handed to the worker, and
    /// joins the worker thread before returning.
    pub fn shutdown(self) {}
}

impl Drop for AudioInputPipeline {
    fn drop(&mut self) {
        tracing::debug!("shutting down audio input pipeline");
        // Closing the channel lets the worker drain and exit.
        self.chunk_tx = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("audio input worker panicked");
            }
        }
    }
}

fn validate_spec(spec: &StreamSpec) -> Result<(), AudioInputError> {
    if spec.channels == 0 || spec.channels > 64 {
        return Err(AudioInputError::InvalidStreamSpec(format!(
            "unsupported channel count {}",
            spec.channels
        )));
    }
    if spec.sample_rate == 0 {
        return Err(AudioInputError::InvalidStreamSpec(
            "zero sample rate".into(),
        ));
    }
    Ok(())
}

fn send_chunk(tx: &Sender<AudioChunk>, chunk: AudioChunk) {
    match tx.try_send(chunk) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::trace!("encoder backlogged, dropping capture frame");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Owns every piece of per-frame state: DSP chain, gate, codec, assembler.
/// Lives on the worker thread for the pipeline's whole lifetime.
struct InputWorker {
    config: InputConfig,
    server: ServerCodecInfo,
    registry: CodecRegistry,
    sinks: InputSinks,
    events: Sender<InputEvent>,
    controls: Arc<Controls>,
    levels: Arc<LevelMeter>,
    shared: Arc<Shared>,
    resync: Arc<Resynchronizer>,
    echo_channels: u32,
    dsp: DspChain,
    gate: VoiceGate,
    codec: CodecStage,
    assembler: PacketAssembler,
    opus_pcm: Vec<i16>,
}

impl InputWorker {
    fn run(mut self, chunks: Receiver<AudioChunk>) {
        tracing::debug!("audio input worker started");
        while let Ok(chunk) = chunks.recv() {
            self.encode_audio_frame(chunk);
        }
        tracing::debug!("audio input worker stopped");
    }

    fn encode_audio_frame(&mut self, mut chunk: AudioChunk) {
        self.assembler.advance_counter(1);

        // One snapshot per frame; later control changes land on the next one.
        let now = Instant::now();
        let snapshot = self.controls.snapshot(now);
        let budget = *self.shared.budget.lock();

        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }

        if self.shared.reset_processor.swap(false, Ordering::Relaxed) {
            self.rebuild_dsp();
        }

        let analysis = self.dsp.process(&mut chunk);
        tracing::trace!(
            mic_db = analysis.peak_mic_db,
            speaker_db = analysis.peak_speaker_db,
            signal_db = analysis.peak_signal_db,
            speech_prob = analysis.speech_prob,
            "frame analysed"
        );

        let events = &self.events;
        let decision = self.gate.decide(&analysis, &snapshot, now, |event| {
            let _ = events.send(event);
        });

        self.shared
            .transmitting
            .store(decision.transmit, Ordering::Relaxed);
        if decision.reset_frame_counter {
            self.assembler.reset_counter();
        }

        if !decision.transmit && !decision.terminator {
            self.levels.set_bitrate(0);
            self.dsp.set_transmitting(false);
            return;
        }
        self.dsp.set_transmitting(true);

        if decision.start_of_utterance {
            self.codec.request_reset();
        }

        let Some((codec, changed)) = self.codec.select(
            &self.server,
            &self.registry,
            self.config.loopback_mode,
            !decision.start_of_utterance,
        ) else {
            tracing::trace!("no usable voice codec, dropping frame");
            return;
        };
        if changed {
            self.assembler.discard();
            self.opus_pcm.clear();
        }

        match codec {
            AudioCodec::Opus => {
                self.encode_opus_frame(&chunk, decision.terminator, &budget, &snapshot);
            }
            AudioCodec::CeltAlpha | AudioCodec::CeltBeta => {
                self.encode_legacy_frame(&chunk, codec, decision.terminator, &budget, &snapshot);
            }
        }

        if decision.terminator {
            self.levels.set_bitrate(0);
        }
    }

    fn encode_opus_frame(
        &mut self,
        chunk: &AudioChunk,
        terminator: bool,
        budget: &BandwidthBudget,
        snapshot: &ControlsSnapshot,
    ) {
        self.opus_pcm.extend_from_slice(&chunk.mic);
        self.assembler.mark_buffered(1);

        if !terminator && self.assembler.buffered_frames() < budget.frames_per_packet {
            return;
        }

        let buffered = self.assembler.buffered_frames();
        if buffered < budget.frames_per_packet {
            // Utterance ended mid-batch: pad with silence so every packet of
            // the stream carries the same frame count. Padding is stream
            // time, so it advances the frame counter too.
            let missing = budget.frames_per_packet - buffered;
            self.opus_pcm
                .extend(std::iter::repeat(0i16).take(FRAME_SIZE * missing as usize));
            self.assembler.mark_buffered(missing);
            self.assembler.advance_counter(u64::from(missing));
        }

        match self.codec.encode_opus(&self.opus_pcm, budget, FRAME_SIZE) {
            Ok((payload, bitrate)) => {
                self.opus_pcm.clear();
                self.levels.set_bitrate(bitrate);
                self.flush(payload, AudioCodec::Opus, terminator, budget, snapshot);
            }
            Err(err) => {
                tracing::warn!(
                    %err,
                    buffered = self.assembler.buffered_frames(),
                    "opus encode failed, dropping buffered batch"
                );
                self.opus_pcm.clear();
                self.assembler.discard();
                self.levels.set_bitrate(0);
            }
        }
    }

    fn encode_legacy_frame(
        &mut self,
        chunk: &AudioChunk,
        codec: AudioCodec,
        terminator: bool,
        budget: &BandwidthBudget,
        snapshot: &ControlsSnapshot,
    ) {
        match self.codec.encode_legacy(&chunk.mic, budget.bitrate) {
            Ok((frame, bitrate)) => {
                self.assembler.mark_buffered(1);
                self.levels.set_bitrate(bitrate);
                self.flush(frame, codec, terminator, budget, snapshot);
            }
            Err(err) => {
                tracing::warn!(%err, "legacy encode failed, dropping frame");
                self.levels.set_bitrate(0);
            }
        }
    }

    fn flush(
        &mut self,
        frame: Bytes,
        codec: AudioCodec,
        terminator: bool,
        budget: &BandwidthBudget,
        snapshot: &ControlsSnapshot,
    ) {
        let ctx = DeliveryContext {
            codec,
            voice_target: snapshot.voice_target,
            loopback: self.config.loopback_mode,
            transmit_position: self.config.network.transmit_position,
            controls: self.controls.as_ref(),
            sinks: &self.sinks,
        };
        self.assembler
            .flush_check(frame, terminator, budget.frames_per_packet, &ctx);
    }

    fn rebuild_dsp(&mut self) {
        let tunables = *self.shared.tunables.lock();
        match DspChain::new(
            tunables,
            FRAME_SIZE,
            SAMPLE_RATE,
            self.echo_channels,
            self.resync.nominal_lag(),
        ) {
            Ok(chain) => {
                self.dsp = chain.with_levels(self.levels.clone());
                self.resync.reset();
                self.codec.request_reset();
                tracing::debug!(?tunables, "audio processor rebuilt");
            }
            Err(err) => {
                tracing::error!(%err, "failed to rebuild audio processor, keeping previous state");
            }
        }
    }
}
