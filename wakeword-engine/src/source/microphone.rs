//! Microphone capture via cpal
//!
//! The device callback downmixes to mono 16-bit and pushes into a lock-free
//! ring; the processing thread drains it through `CaptureStream::read`.

use super::{AudioSource, CaptureStream, DeviceError, ReadError};
use crate::config::CaptureParams;
use crate::frame::AudioSample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Seconds of audio the device ring can hold before the callback drops samples
const DEVICE_BUFFER_SECS: usize = 2;

/// Sleep between polls of the device ring while waiting for audio
const POLL_INTERVAL: Duration = Duration::from_millis(5);

type DeviceRing = HeapRb<AudioSample>;
type DeviceProducer = <DeviceRing as Split>::Prod;
type DeviceConsumer = <DeviceRing as Split>::Cons;

/// Captures from a system input device
#[derive(Debug, Default, Clone, Copy)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    pub fn new() -> Self {
        Self
    }

    fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, DeviceError> {
        match name {
            None => host.default_input_device().ok_or(DeviceError::NoDevice),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| DeviceError::Open(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(wanted.to_string())),
        }
    }

    /// Pick a config at `sample_rate`, preferring fewer channels and native i16
    fn select_config(
        device: &Device,
        sample_rate: u32,
    ) -> Result<(StreamConfig, SampleFormat), DeviceError> {
        let rate = SampleRate(sample_rate);

        let supported = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?
            .filter(|c| matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32))
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::I16))
            .ok_or_else(|| {
                DeviceError::UnsupportedConfig(format!(
                    "no i16/f32 input config at {} Hz",
                    sample_rate
                ))
            })?;

        let format = supported.sample_format();
        Ok((supported.with_sample_rate(rate).config(), format))
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&mut self, params: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let host = cpal::default_host();
        let device = Self::select_device(&host, params.device.as_deref())?;
        let (config, format) = Self::select_config(&device, params.sample_rate)?;

        info!(
            "Opening input device '{}' ({} Hz, {} ch, {:?})",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            format
        );

        let ring = DeviceRing::new(params.sample_rate as usize * DEVICE_BUFFER_SECS);
        let (producer, consumer) = ring.split();
        let fault = DeviceFault::default();
        let overruns = Arc::new(AtomicU64::new(0));

        let callback = DeviceCallback {
            producer,
            channels: config.channels as usize,
            scratch: Vec::with_capacity(params.frame_size),
            overruns: Arc::clone(&overruns),
        };

        let stream = match format {
            SampleFormat::I16 => {
                build_stream(&device, &config, callback, fault.clone(), |s: i16| s)?
            }
            SampleFormat::F32 => {
                build_stream(&device, &config, callback, fault.clone(), f32_to_i16)?
            }
            other => {
                return Err(DeviceError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| DeviceError::Open(e.to_string()))?;

        Ok(Box::new(MicrophoneStream {
            stream: Some(stream),
            consumer,
            fault,
            overruns,
        }))
    }
}

/// Error reported by the cpal error callback
///
/// The first fault sticks: some backends report a disconnect once and then
/// never call back again, so every later read must keep failing.
#[derive(Debug, Clone, Default)]
struct DeviceFault(Arc<Mutex<Option<String>>>);

impl DeviceFault {
    fn record(&self, message: String) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(message);
        }
    }

    fn current(&self) -> Option<String> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// State moved into the device callback
struct DeviceCallback {
    producer: DeviceProducer,
    channels: usize,
    scratch: Vec<AudioSample>,
    overruns: Arc<AtomicU64>,
}

fn build_stream<T, F>(
    device: &Device,
    config: &StreamConfig,
    mut callback: DeviceCallback,
    fault: DeviceFault,
    convert: F,
) -> Result<Stream, DeviceError>
where
    T: SizedSample,
    F: Fn(T) -> AudioSample + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                callback.scratch.clear();
                downmix(data, callback.channels, &convert, &mut callback.scratch);

                let written = callback.producer.push_slice(&callback.scratch);
                let lost = callback.scratch.len() - written;
                if lost > 0 {
                    callback.overruns.fetch_add(lost as u64, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("Audio capture error: {}", err);
                fault.record(err.to_string());
            },
            None,
        )
        .map_err(|e| DeviceError::Open(e.to_string()))
}

/// Average interleaved channels into mono samples
fn downmix<T, F>(data: &[T], channels: usize, convert: F, out: &mut Vec<AudioSample>)
where
    T: Copy,
    F: Fn(T) -> AudioSample,
{
    let channels = channels.max(1);
    out.extend(data.chunks(channels).map(|frame| {
        let sum: i32 = frame.iter().map(|&s| convert(s) as i32).sum();
        (sum / frame.len() as i32) as AudioSample
    }));
}

fn f32_to_i16(sample: f32) -> AudioSample {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as AudioSample
}

struct MicrophoneStream {
    stream: Option<Stream>,
    consumer: DeviceConsumer,
    fault: DeviceFault,
    overruns: Arc<AtomicU64>,
}

/// Drain the device ring into `buf` until it is full or `timeout` passes
fn fill_from_ring(
    consumer: &mut DeviceConsumer,
    fault: &DeviceFault,
    buf: &mut [AudioSample],
    timeout: Duration,
) -> Result<usize, ReadError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    loop {
        if let Some(message) = fault.current() {
            return Err(ReadError::Stream(message));
        }

        filled += consumer.pop_slice(&mut buf[filled..]);
        if filled == buf.len() || Instant::now() >= deadline {
            return Ok(filled);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

impl CaptureStream for MicrophoneStream {
    fn read(&mut self, buf: &mut [AudioSample], timeout: Duration) -> Result<usize, ReadError> {
        if self.stream.is_none() {
            return Err(ReadError::Closed);
        }

        let filled = fill_from_ring(&mut self.consumer, &self.fault, buf, timeout)?;

        let lost = self.overruns.swap(0, Ordering::Relaxed);
        if lost > 0 {
            warn!("Device ring overrun, {} samples lost", lost);
        }

        Ok(filled)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Failed to pause input stream: {}", e);
            }
            drop(stream);
            info!("Input device closed");
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let mut out = Vec::new();
        downmix(&[100i16, 300, -50, 50, 7, 7], 2, |s| s, &mut out);
        assert_eq!(out, vec![200, 0, 7]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let mut out = Vec::new();
        downmix(&[1i16, 2, 3], 1, |s| s, &mut out);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_f32_conversion_clamps() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(2.5), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);
    }

    #[test]
    fn test_fill_from_ring_drains_available_audio() {
        let (mut producer, mut consumer) = DeviceRing::new(64).split();
        producer.push_slice(&[1, 2, 3]);

        let mut buf = [0i16; 8];
        let n = fill_from_ring(
            &mut consumer,
            &DeviceFault::default(),
            &mut buf,
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_device_fault_keeps_failing_reads() {
        let (mut producer, mut consumer) = DeviceRing::new(64).split();
        let fault = DeviceFault::default();
        fault.record("device no longer available".to_string());
        fault.record("later error".to_string());

        let mut buf = [0i16; 8];
        for _ in 0..3 {
            match fill_from_ring(&mut consumer, &fault, &mut buf, Duration::from_millis(1)) {
                Err(ReadError::Stream(message)) => {
                    assert_eq!(message, "device no longer available")
                }
                other => panic!("Expected stream error, got {:?}", other),
            }
        }

        // Audio arriving after the fault does not revive the stream
        producer.push_slice(&[5; 8]);
        assert!(fill_from_ring(&mut consumer, &fault, &mut buf, Duration::from_millis(1)).is_err());
    }
}
