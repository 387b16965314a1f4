//! CPAL-based audio output backend.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::traits::{AudioError, Frame, SampleSource};

/// Frames pulled from the source per pump iteration.
const PUMP_CHUNK_FRAMES: usize = 1024;

/// CPAL output fed by a pump thread.
///
/// The pump pulls buffers from the [`SampleSource`] and pushes frames
/// into a lock-free ring; the device callback pops them. When the ring
/// is full the pump spins, which freezes the source exactly where the
/// listener hears it.
pub struct CpalOutput {
    stream: Option<Stream>,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    position_frames: Arc<AtomicU64>,
    pump: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device at the given rate and start the
    /// pump thread. Playback begins paused; call `play`.
    pub fn new(sample_rate: u32, mut source: Box<dyn SampleSource>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceInit(e.to_string()))?;
        let mut config: StreamConfig = supported.into();
        // The callback assumes 2-channel interleaving at our rate.
        config.channels = 2;
        config.sample_rate = cpal::SampleRate(sample_rate);

        // About 100ms of buffered frames between pump and callback.
        let rb = HeapRb::<Frame>::new((sample_rate as usize / 10).max(PUMP_CHUNK_FRAMES));
        let (mut producer, mut consumer) = rb.split();

        let running = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let position_frames = Arc::new(AtomicU64::new(0));

        let cb_running = running.clone();
        let cb_position = position_frames.clone();
        let channels = config.channels as usize;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !cb_running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    let mut popped = 0u64;
                    for chunk in data.chunks_mut(channels) {
                        match consumer.try_pop() {
                            Some(frame) => {
                                popped += 1;
                                for (i, sample) in chunk.iter_mut().enumerate() {
                                    *sample = match i {
                                        0 => frame.left,
                                        1 => frame.right,
                                        _ => 0.0,
                                    };
                                }
                            }
                            None => chunk.fill(0.0),
                        }
                    }
                    cb_position.fetch_add(popped, Ordering::Relaxed);
                },
                |err| eprintln!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

        let pump_stopped = stopped.clone();
        let pump = std::thread::spawn(move || {
            let mut buf = vec![0.0f32; PUMP_CHUNK_FRAMES * 2];
            loop {
                if pump_stopped.load(Ordering::Relaxed) {
                    break;
                }
                source.process(&mut buf);
                for pair in buf.chunks_exact(2) {
                    let frame = Frame {
                        left: pair[0],
                        right: pair[1],
                    };
                    // Spin until the callback frees room or we stop.
                    while producer.try_push(frame).is_err() {
                        if pump_stopped.load(Ordering::Relaxed) {
                            return;
                        }
                        std::hint::spin_loop();
                    }
                }
                if source.finished() {
                    break;
                }
            }
        });

        Ok(Self {
            stream: Some(stream),
            sample_rate,
            running,
            stopped,
            position_frames,
            pump: Some(pump),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn play(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::Relaxed);
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| AudioError::Playback(e.to_string()))?;
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| AudioError::Playback(e.to_string()))?;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        self.stream = None;
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        Ok(())
    }

    /// Frames actually delivered to the device so far: the playback
    /// position the listener currently hears.
    pub fn position_frames(&self) -> u64 {
        self.position_frames.load(Ordering::Relaxed)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
