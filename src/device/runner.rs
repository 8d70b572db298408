//! Device main loop
//!
//! Feeds captured frames to the voice activity controller, mirrors its
//! decisions onto the link as `audio:start` / binary frames / `audio:end`,
//! and handles whatever the relay sends back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tokio::sync::{mpsc, watch};

use super::link::{DeviceLink, LinkEvent};
use super::source::{SampleSource, pcm_to_wav};
use crate::protocol::{AudioResponsePayload, DeviceStatus};
use crate::vad::{
    TriggerSource, VadEvent, VoiceActivityController, VoiceSessionState, samples_to_pcm,
};
use crate::{Error, Result};

/// What a device run accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Utterances streamed to the relay
    pub utterances: usize,
    /// Utterances captured while the link was down
    pub dropped: usize,
    /// Playback responses fully received
    pub playbacks: usize,
    /// Commands received, by name
    pub commands: Vec<String>,
    /// Files written for received playback
    pub saved: Vec<PathBuf>,
}

struct Playback {
    header: AudioResponsePayload,
    data: BytesMut,
}

/// Drives a [`DeviceLink`] from a [`SampleSource`]
pub struct DeviceRunner<S> {
    link: DeviceLink,
    events: mpsc::Receiver<LinkEvent>,
    vad: VoiceActivityController,
    source: S,
    status_interval: Duration,
    linger: Duration,
    playback_dir: Option<PathBuf>,
    buttons: Option<mpsc::Receiver<()>>,
    origin: Instant,
    captured_samples: u64,
    streamed: Option<usize>,
    playback: Option<Playback>,
    summary: RunSummary,
}

impl<S: SampleSource> DeviceRunner<S> {
    #[must_use]
    pub fn new(
        link: DeviceLink,
        events: mpsc::Receiver<LinkEvent>,
        vad: VoiceActivityController,
        source: S,
    ) -> Self {
        Self {
            link,
            events,
            vad,
            source,
            status_interval: Duration::from_secs(30),
            linger: Duration::from_secs(5),
            playback_dir: None,
            buttons: None,
            origin: Instant::now(),
            captured_samples: 0,
            streamed: None,
            playback: None,
            summary: RunSummary::default(),
        }
    }

    /// Interval between `device:status` reports
    #[must_use]
    pub const fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// How long to keep listening for responses once the source runs dry
    #[must_use]
    pub const fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Write received playback as WAV files into `dir`
    #[must_use]
    pub fn save_playback(mut self, dir: PathBuf) -> Self {
        self.playback_dir = Some(dir);
        self
    }

    /// Manual trigger input
    #[must_use]
    pub fn buttons(mut self, buttons: mpsc::Receiver<()>) -> Self {
        self.buttons = Some(buttons);
        self
    }

    /// Run until the source is exhausted (plus linger), the link gives up,
    /// or `shutdown` flips to true
    ///
    /// The link is closed on return.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` if the link exhausted its reconnect
    /// attempts, or a source error
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let period = self.status_interval.max(Duration::from_millis(1));
        let mut status = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut exhausted = false;
        let linger = tokio::time::sleep(Duration::MAX);
        tokio::pin!(linger);

        let result = loop {
            tokio::select! {
                frame = self.source.next_frame(), if !exhausted => match frame {
                    Ok(Some(samples)) => self.on_frame(&samples).await,
                    Ok(None) => {
                        tracing::debug!("sample source exhausted");
                        exhausted = true;
                        linger.as_mut().reset(tokio::time::Instant::now() + self.linger);
                    }
                    Err(e) => break Err(e),
                },
                event = self.events.recv() => match event {
                    Some(LinkEvent::GaveUp) => {
                        break Err(Error::Unavailable("relay unreachable".to_string()));
                    }
                    Some(event) => self.on_link_event(event),
                    None => break Ok(()),
                },
                Some(()) = recv_button(self.buttons.as_mut()) => {
                    let at = self.clock();
                    if let Some(event) = self.vad.press_button(at) {
                        self.on_vad_event(event, &[]).await;
                    }
                }
                _ = status.tick() => {
                    let sent = self.link.send_status(self.status());
                    tracing::trace!(sent, "status report");
                }
                () = &mut linger, if exhausted => break Ok(()),
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break Ok(()),
            }
        };

        self.link.close();
        result.map(|()| self.summary)
    }

    /// Capture instant of the last sample consumed
    fn clock(&self) -> Instant {
        let rate = u64::from(self.source.format().sample_rate.max(1));
        self.origin + Duration::from_micros(self.captured_samples * 1_000_000 / rate)
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            battery: None,
            rssi: 0,
            free_heap: 0,
            recording: self.vad.state() == VoiceSessionState::Recording,
            uptime_ms: u64::try_from(self.clock().duration_since(self.origin).as_millis()).ok(),
        }
    }

    async fn on_frame(&mut self, samples: &[i16]) {
        self.captured_samples += samples.len() as u64;
        let at = self.clock();

        match self.vad.process_frame(samples, at) {
            Some(event) => self.on_vad_event(event, samples).await,
            None if self.vad.state() == VoiceSessionState::Recording => {
                if let Some(streamed) = self.streamed.as_mut() {
                    *streamed += samples.len();
                    if !self.link.send_audio_chunk(&samples_to_pcm(samples)).await {
                        tracing::debug!("audio chunk not sent");
                    }
                }
            }
            None => {}
        }
    }

    async fn on_vad_event(&mut self, event: VadEvent, frame: &[i16]) {
        match event {
            VadEvent::CaptureStarted { source, .. } => {
                match self.link.start_audio_stream(self.source.format()).await {
                    Ok(stream_id) => {
                        tracing::info!(stream_id, ?source, "capture started");
                        self.streamed = Some(0);
                        if source == TriggerSource::Energy && !frame.is_empty() {
                            self.streamed = Some(frame.len());
                            self.link.send_audio_chunk(&samples_to_pcm(frame)).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot stream utterance");
                        self.streamed = None;
                    }
                }
            }
            VadEvent::UtteranceComplete(utterance) => {
                match self.streamed.take() {
                    Some(sent) => {
                        let rest = &utterance.samples[sent.min(utterance.samples.len())..];
                        if !rest.is_empty() {
                            self.link.send_audio_chunk(&samples_to_pcm(rest)).await;
                        }
                        match self.link.end_audio_stream().await {
                            Ok(()) => self.summary.utterances += 1,
                            Err(e) => {
                                tracing::warn!(error = %e, "utterance lost");
                                self.summary.dropped += 1;
                            }
                        }
                    }
                    None => self.summary.dropped += 1,
                }
                tracing::info!(
                    reason = ?utterance.reason,
                    duration_ms = utterance.duration.as_millis(),
                    "utterance complete"
                );
                self.vad.acknowledge();
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(session) => {
                tracing::info!(session_id = %session.session_id, "link up");
            }
            LinkEvent::Disconnected => {
                tracing::warn!("link down");
                if self.streamed.take().is_some() {
                    self.vad.reset();
                    self.summary.dropped += 1;
                }
            }
            LinkEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "link reconnecting");
            }
            LinkEvent::GaveUp => {}
            LinkEvent::Playback(header) => {
                tracing::debug!(
                    stream_id = header.stream_id,
                    total_bytes = header.total_bytes,
                    text = ?header.text,
                    "playback announced"
                );
                let expected = usize::try_from(header.total_bytes).unwrap_or(0);
                self.playback = Some(Playback {
                    header,
                    data: BytesMut::with_capacity(expected),
                });
                self.finish_playback_if_complete();
            }
            LinkEvent::PlaybackChunk(frame) => {
                let Some(playback) = self.playback.as_mut() else {
                    tracing::debug!(stream_id = frame.stream_id, "playback frame without header");
                    return;
                };
                if frame.stream_id != playback.header.stream_id {
                    tracing::debug!(stream_id = frame.stream_id, "playback frame for other stream");
                    return;
                }
                playback.data.put_slice(&frame.payload);
                self.finish_playback_if_complete();
            }
            LinkEvent::Command(command) => {
                tracing::info!(command = %command.command, params = %command.params, "command received");
                self.summary.commands.push(command.command);
            }
            LinkEvent::ServerError(error) => {
                tracing::warn!(code = ?error.code, message = %error.message, "relay reported error");
            }
        }
    }

    fn finish_playback_if_complete(&mut self) {
        let complete = self
            .playback
            .as_ref()
            .is_some_and(|p| p.data.len() as u64 >= p.header.total_bytes);
        if !complete {
            return;
        }
        let Some(playback) = self.playback.take() else {
            return;
        };

        self.summary.playbacks += 1;
        tracing::info!(
            stream_id = playback.header.stream_id,
            bytes = playback.data.len(),
            "playback received"
        );

        let Some(dir) = self.playback_dir.as_ref() else {
            return;
        };
        let path = dir.join(format!(
            "playback-{}-{}.wav",
            playback.header.stream_id, self.summary.playbacks
        ));
        match pcm_to_wav(&playback.data, playback.header.format)
            .and_then(|wav| std::fs::write(&path, wav).map_err(Error::from))
        {
            Ok(()) => self.summary.saved.push(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save playback"),
        }
    }
}

async fn recv_button(buttons: Option<&mut mpsc::Receiver<()>>) -> Option<()> {
    match buttons {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
