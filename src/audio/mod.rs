//! Audio decode path.
//!
//! Notification payloads reach this module as opaque byte frames. A
//! dedicated worker thread drains a serial queue of
//! (lifecycle | config | frame) messages in strict arrival order, runs
//! them through the in-band demux and the ADPCM decoder, and publishes
//! decoded PCM blocks on the engine's event channel. Keeping the
//! decode off the notification path means a slow consumer never blocks
//! inbound delivery.

pub mod adpcm;
pub mod demux;

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::{debug, error};

use crate::config::{
    AUDIO_CONTROL_OP_DATA_MASK, AUDIO_CONTROL_OP_MASK, AUDIO_CONTROL_OP_RESET,
    AUDIO_CONTROL_OP_SETMODE, AUDIO_CONTROL_OP_SHIFT, AUDIO_MODE_64KBPS, AUDIO_MODE_AUTOMATIC,
    FEATURE_INBAND_CONTROL, FEATURE_NOT_PACKET_BASED,
};
use crate::engine::Event;
use crate::error::Error;

use adpcm::AdpcmDecoder;
use demux::{InbandDemux, Segment};

/// Messages handled by the decode worker, in arrival order. Ordering
/// between stream-enable, mode changes and subsequent frames is load
/// bearing: commands gate the audio that follows them.
#[derive(Clone, Debug)]
pub enum AudioMessage {
    /// Streaming started; re-arm the decode state.
    StreamOn,
    /// Streaming stopped.
    StreamOff,
    /// One notification payload of encoded audio.
    Frame(Vec<u8>),
    /// Host-requested decode mode (AUDIO_MODE_AUTOMATIC defers to the
    /// peripheral's in-band commands).
    SetMode(u8),
    /// Feature bitmask from the peripheral's config frame.
    SetFeatures(u8),
    Shutdown,
}

/// Synchronous decode state: demux + decoder + the feature flags that
/// select between them. The worker thread is a thin shell around this.
pub struct AudioProcessor {
    decoder: AdpcmDecoder,
    demux: InbandDemux,
    inband_control: bool,
    decode_mode: u8,
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioProcessor {
    pub fn new() -> Self {
        Self {
            decoder: AdpcmDecoder::new(),
            demux: InbandDemux::new(),
            inband_control: false,
            decode_mode: AUDIO_MODE_64KBPS,
        }
    }

    /// Apply one message; `Frame` may yield a PCM block.
    pub fn handle(&mut self, message: AudioMessage) -> Option<Vec<i16>> {
        match message {
            AudioMessage::StreamOn => {
                debug!("audio stream start");
                self.demux.clear();
                if !self.inband_control {
                    self.decoder.reset();
                }
                if self.decode_mode != AUDIO_MODE_AUTOMATIC {
                    self.decoder.set_mode(self.decode_mode);
                }
                None
            }
            AudioMessage::StreamOff => {
                debug!("audio stream stop");
                None
            }
            AudioMessage::SetFeatures(features) => {
                debug!("audio features: {features:#04x}");
                self.inband_control = features & FEATURE_INBAND_CONTROL != 0;
                self.decoder
                    .set_partial_samples(features & FEATURE_NOT_PACKET_BASED != 0);
                None
            }
            AudioMessage::SetMode(mode) => {
                self.decode_mode = mode;
                if mode != AUDIO_MODE_AUTOMATIC {
                    self.decoder.set_mode(mode);
                }
                None
            }
            AudioMessage::Frame(bytes) => self.process_frame(&bytes),
            AudioMessage::Shutdown => None,
        }
    }

    pub fn escaped_audio_bytes(&self) -> u64 {
        self.demux.escaped_audio_bytes()
    }

    fn process_frame(&mut self, bytes: &[u8]) -> Option<Vec<i16>> {
        // Without in-band control the whole payload is audio.
        if !self.inband_control {
            return Some(self.decoder.process(bytes));
        }

        let mut pcm = Vec::new();
        for segment in self.demux.split(bytes) {
            match segment {
                Segment::Audio(run) => pcm.extend(self.decoder.process(&run)),
                Segment::Command(command) => self.apply_command(command),
            }
        }
        if pcm.is_empty() {
            None
        } else {
            Some(pcm)
        }
    }

    fn apply_command(&mut self, command: u8) {
        debug!("in-band audio command: {command:#04x}");
        let opcode = (command & AUDIO_CONTROL_OP_MASK) >> AUDIO_CONTROL_OP_SHIFT;
        match opcode {
            AUDIO_CONTROL_OP_RESET => self.decoder.reset(),
            AUDIO_CONTROL_OP_SETMODE => self.decoder.set_mode(command & AUDIO_CONTROL_OP_DATA_MASK),
            _ => error!("unknown in-band command: {command:#04x}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn decoder(&self) -> &AdpcmDecoder {
        &self.decoder
    }
}

/// Handle to the decode worker thread.
pub struct AudioPipeline {
    tx: Sender<AudioMessage>,
    worker: Option<JoinHandle<()>>,
}

impl AudioPipeline {
    /// Spawn the worker; decoded PCM is published on `events`.
    pub fn spawn(events: Sender<Event>) -> Result<Self, Error> {
        let (tx, rx) = unbounded::<AudioMessage>();
        let worker = thread::Builder::new()
            .name("rcu-audio".into())
            .spawn(move || {
                let mut processor = AudioProcessor::new();
                while let Ok(message) = rx.recv() {
                    if matches!(message, AudioMessage::Shutdown) {
                        break;
                    }
                    if let Some(pcm) = processor.handle(message) {
                        if events.send(Event::DecodedAudio(pcm)).is_err() {
                            break;
                        }
                    }
                }
            })
            .map_err(Error::Worker)?;
        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    pub fn send(&self, message: AudioMessage) {
        let _ = self.tx.send(message);
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(AudioMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AUDIO_CONTROL_ESCAPE, AUDIO_MODE_48KBPS, FEATURE_COMMAND_SUPPORT,
    };

    const ESC: u8 = AUDIO_CONTROL_ESCAPE;

    #[test]
    fn frames_decode_directly_without_inband_control() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::StreamOn);
        // Escape bytes are plain audio when the feature is off.
        let pcm = processor.handle(AudioMessage::Frame(vec![ESC, ESC])).unwrap();
        assert_eq!(pcm.len(), 4);
    }

    #[test]
    fn inband_reset_command_zeroes_decoder_between_runs() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(FEATURE_INBAND_CONTROL));
        processor.handle(AudioMessage::StreamOn);

        processor.handle(AudioMessage::Frame(vec![0x77, 0x77]));
        assert_ne!(processor.decoder().predictor(), 0);

        let pcm = processor
            .handle(AudioMessage::Frame(vec![ESC, 0x00, 0x00]))
            .unwrap();
        // Post-reset silence codes decode to exact zeros.
        assert_eq!(pcm, vec![0, 0]);
        assert_eq!(processor.decoder().predictor(), 0);
        assert_eq!(processor.decoder().quantizer_index(), 0);
    }

    #[test]
    fn inband_mode_command_applies_before_following_audio() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(FEATURE_INBAND_CONTROL));
        processor.handle(AudioMessage::StreamOn);

        processor.handle(AudioMessage::Frame(vec![ESC, 0x11]));
        assert_eq!(processor.decoder().mode(), AUDIO_MODE_48KBPS);
    }

    #[test]
    fn stream_start_resets_decoder_when_not_inband() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::Frame(vec![0x77, 0x77]));
        assert_ne!(processor.decoder().predictor(), 0);
        processor.handle(AudioMessage::StreamOn);
        assert_eq!(processor.decoder().predictor(), 0);
    }

    #[test]
    fn stream_start_preserves_decoder_when_inband() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(FEATURE_INBAND_CONTROL));
        processor.handle(AudioMessage::Frame(vec![0x77, 0x77]));
        let predictor = processor.decoder().predictor();
        processor.handle(AudioMessage::StreamOn);
        assert_eq!(processor.decoder().predictor(), predictor);
    }

    #[test]
    fn automatic_mode_leaves_decoder_mode_alone() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(FEATURE_INBAND_CONTROL));
        processor.handle(AudioMessage::Frame(vec![ESC, 0x11]));
        processor.handle(AudioMessage::SetMode(AUDIO_MODE_AUTOMATIC));
        processor.handle(AudioMessage::StreamOn);
        assert_eq!(processor.decoder().mode(), AUDIO_MODE_48KBPS);
    }

    #[test]
    fn features_toggle_partial_samples() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(
            FEATURE_INBAND_CONTROL | FEATURE_NOT_PACKET_BASED | FEATURE_COMMAND_SUPPORT,
        ));
        assert!(processor.decoder().partial_samples());
        processor.handle(AudioMessage::SetFeatures(0));
        assert!(!processor.decoder().partial_samples());
    }

    #[test]
    fn command_only_frame_yields_no_pcm() {
        let mut processor = AudioProcessor::new();
        processor.handle(AudioMessage::SetFeatures(FEATURE_INBAND_CONTROL));
        assert!(processor
            .handle(AudioMessage::Frame(vec![ESC, 0x00]))
            .is_none());
    }

    #[test]
    fn pipeline_publishes_decoded_audio() {
        let (tx, rx) = unbounded();
        let pipeline = AudioPipeline::spawn(tx).unwrap();
        pipeline.send(AudioMessage::StreamOn);
        pipeline.send(AudioMessage::Frame(vec![0x17, 0x89]));
        match rx.recv_timeout(std::time::Duration::from_secs(5)) {
            Ok(Event::DecodedAudio(pcm)) => assert_eq!(pcm, vec![2, 15, 13, 8]),
            other => panic!("expected decoded audio, got {other:?}"),
        }
        drop(pipeline);
    }
}
