//! Audio sample sources for the device runner

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::AudioFormat;
use crate::{Error, Result};

/// Produces fixed-size frames of 16-bit PCM
#[async_trait]
pub trait SampleSource: Send {
    /// Format of the produced samples
    fn format(&self) -> AudioFormat;

    /// Next frame, or `None` once the source is exhausted
    ///
    /// # Errors
    ///
    /// Returns error if the underlying device fails
    async fn next_frame(&mut self) -> Result<Option<Vec<i16>>>;
}

/// Plays a WAV file as if it were a microphone
pub struct WavSource {
    format: AudioFormat,
    samples: Vec<i16>,
    position: usize,
    frame_samples: usize,
    pacing: Option<tokio::time::Interval>,
}

impl std::fmt::Debug for WavSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSource")
            .field("format", &self.format)
            .field("samples", &self.samples.len())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl WavSource {
    /// Load a 16-bit PCM WAV file
    ///
    /// Multi-channel files are downmixed to mono.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not 16-bit integer PCM
    pub fn open(path: &Path, frame_samples: usize) -> Result<Self> {
        let reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(Error::Audio(format!(
                "{}: expected 16-bit PCM, got {} bits",
                path.display(),
                spec.bits_per_sample
            )));
        }

        let interleaved = reader
            .into_samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let samples = downmix(&interleaved, usize::from(spec.channels));

        tracing::debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            samples = samples.len(),
            "loaded wav source"
        );

        Ok(Self::from_samples(samples, spec.sample_rate, frame_samples))
    }

    /// Wrap in-memory mono samples
    #[must_use]
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            format: AudioFormat {
                sample_rate,
                ..AudioFormat::default()
            },
            samples,
            position: 0,
            frame_samples: frame_samples.max(1),
            pacing: None,
        }
    }

    /// Deliver frames at the rate a live microphone would
    #[must_use]
    pub fn realtime(mut self) -> Self {
        let micros = self.frame_samples as u64 * 1_000_000 / u64::from(self.format.sample_rate.max(1));
        let mut interval = tokio::time::interval(Duration::from_micros(micros.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.pacing = Some(interval);
        self
    }

    /// Append silence so trailing speech can time out
    #[must_use]
    pub fn with_trailing_silence(mut self, duration: Duration) -> Self {
        let samples = u128::from(self.format.sample_rate) * duration.as_millis() / 1_000;
        let samples = usize::try_from(samples).unwrap_or(0);
        self.samples.resize(self.samples.len() + samples, 0);
        self
    }

    /// Duration of one frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        let micros = self.frame_samples as u64 * 1_000_000 / u64::from(self.format.sample_rate.max(1));
        Duration::from_micros(micros)
    }
}

#[async_trait]
impl SampleSource for WavSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }

        let end = (self.position + self.frame_samples).min(self.samples.len());
        let frame = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(frame))
    }
}

fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let mean = (sum / frame.len() as i32) as i16;
            mean
        })
        .collect()
}

/// Encode little-endian PCM as a WAV file
///
/// # Errors
///
/// Returns error if the format is not 16-bit or encoding fails
pub fn pcm_to_wav(pcm: &[u8], format: AudioFormat) -> Result<Vec<u8>> {
    if format.bits_per_sample != 16 {
        return Err(Error::Audio(format!(
            "cannot write {}-bit audio",
            format.bits_per_sample
        )));
    }

    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(feature = "mic")]
pub use mic::MicSource;

#[cfg(feature = "mic")]
mod mic {
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, StreamConfig};
    use tokio::sync::mpsc;

    use super::SampleSource;
    use crate::protocol::AudioFormat;
    use crate::{Error, Result};

    /// Default input device, captured on a dedicated thread
    ///
    /// `cpal` streams are not `Send`, so the stream lives on its own thread
    /// and forwards converted samples over a channel.
    pub struct MicSource {
        format: AudioFormat,
        frame_samples: usize,
        pending: Vec<i16>,
        samples: mpsc::Receiver<Vec<i16>>,
        stop: Option<std::sync::mpsc::Sender<()>>,
    }

    impl std::fmt::Debug for MicSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MicSource")
                .field("format", &self.format)
                .finish_non_exhaustive()
        }
    }

    impl MicSource {
        /// Open the default input device at `sample_rate`, mono
        ///
        /// # Errors
        ///
        /// Returns error if no suitable input device exists
        pub fn open(sample_rate: u32, frame_samples: usize) -> Result<Self> {
            let (sample_tx, sample_rx) = mpsc::channel(64);
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

            std::thread::Builder::new()
                .name("uebot-mic".to_string())
                .spawn(move || {
                    let stream = match build_stream(sample_rate, sample_tx) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // Parks until the source is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("audio capture stopped");
                })?;

            ready_rx
                .recv()
                .map_err(|_| Error::Audio("capture thread exited".to_string()))??;

            Ok(Self {
                format: AudioFormat {
                    sample_rate,
                    ..AudioFormat::default()
                },
                frame_samples: frame_samples.max(1),
                pending: Vec::new(),
                samples: sample_rx,
                stop: Some(stop_tx),
            })
        }
    }

    impl Drop for MicSource {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    fn build_stream(sample_rate: u32, tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;
        let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            "audio capture initialized"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    #[allow(clippy::cast_possible_truncation)]
                    let converted: Vec<i16> = data
                        .iter()
                        .map(|&s| (s * 32_767.0).clamp(-32_768.0, 32_767.0) as i16)
                        .collect();
                    if tx.try_send(converted).is_err() {
                        tracing::trace!("capture queue full, dropping samples");
                    }
                },
                |err| tracing::error!(error = %err, "audio capture error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        Ok(stream)
    }

    #[async_trait]
    impl SampleSource for MicSource {
        fn format(&self) -> AudioFormat {
            self.format
        }

        async fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
            while self.pending.len() < self.frame_samples {
                match self.samples.recv().await {
                    Some(chunk) => self.pending.extend_from_slice(&chunk),
                    None => return Ok(None),
                }
            }
            let rest = self.pending.split_off(self.frame_samples);
            Ok(Some(std::mem::replace(&mut self.pending, rest)))
        }
    }
}
