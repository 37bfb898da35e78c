//! Attention tone for due reminders.
//!
//! Five short 880 Hz beeps, one every 500 ms. Playback stays locked until the
//! first user gesture has been observed; calls before that are logged no-ops.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use log::{debug, info};

use crate::error::{ReminderError, Result};

pub const TONE_COUNT: usize = 5;
pub const TONE_SPACING: Duration = Duration::from_millis(500);
pub const TONE_LENGTH: Duration = Duration::from_millis(200);
pub const TONE_FREQUENCY_HZ: f32 = 880.0;
pub const SAMPLE_RATE: u32 = 44_100;

const ATTACK: Duration = Duration::from_millis(10);
const PEAK_GAIN: f32 = 0.3;

/// Mono PCM for the whole alarm, silence between beeps included.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSequence {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl ToneSequence {
    pub fn alarm() -> Self {
        let spacing = samples_for(TONE_SPACING);
        let tone_len = samples_for(TONE_LENGTH);
        let attack = samples_for(ATTACK).max(1);
        let total = spacing * (TONE_COUNT - 1) + tone_len;

        let mut samples = vec![0.0; total];
        for tone in 0..TONE_COUNT {
            let start = tone * spacing;
            for i in 0..tone_len {
                let t = i as f32 / SAMPLE_RATE as f32;
                let envelope = if i < attack {
                    i as f32 / attack as f32
                } else {
                    let decay = (i - attack) as f32 / (tone_len - attack) as f32;
                    (1.0 - decay).max(0.0).powi(2)
                };
                samples[start + i] =
                    (2.0 * std::f32::consts::PI * TONE_FREQUENCY_HZ * t).sin() * envelope * PEAK_GAIN;
            }
        }

        Self {
            sample_rate: SAMPLE_RATE,
            samples,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Sample offsets where each beep begins.
    pub fn onsets(&self) -> Vec<usize> {
        (0..TONE_COUNT).map(|n| n * samples_for(TONE_SPACING)).collect()
    }
}

fn samples_for(duration: Duration) -> usize {
    (duration.as_secs_f64() * f64::from(SAMPLE_RATE)).round() as usize
}

pub trait AudioOutput: Send + Sync {
    fn play(&self, sequence: &ToneSequence) -> Result<()>;
}

/// For hosts without an audio device; the client plays its own chime.
pub struct SilentOutput;

impl AudioOutput for SilentOutput {
    fn play(&self, sequence: &ToneSequence) -> Result<()> {
        debug!("Alarm of {:?} suppressed (no audio output)", sequence.duration());
        Ok(())
    }
}

pub struct AlarmEmitter {
    unlocked: AtomicBool,
    output: Arc<dyn AudioOutput>,
    sequence: ToneSequence,
}

impl AlarmEmitter {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            unlocked: AtomicBool::new(false),
            output,
            sequence: ToneSequence::alarm(),
        }
    }

    /// Records the first user gesture.
    pub fn unlock(&self) {
        if !self.unlocked.swap(true, Ordering::SeqCst) {
            info!("Audio unlocked by user gesture");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    pub fn play_alarm(&self) -> Result<()> {
        if !self.is_unlocked() {
            debug!("Alarm skipped: no user gesture observed yet");
            return Err(ReminderError::AudioPolicy);
        }
        self.output.play(&self.sequence)
    }
}

#[cfg(feature = "speaker")]
pub mod speaker {
    //! Plays the alarm on the default output device.

    use std::sync::{
        mpsc::{self, Sender},
        Mutex,
    };
    use std::thread;

    use log::error;
    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, Sink};

    use super::{AudioOutput, ToneSequence};
    use crate::error::{ReminderError, Result};

    /// Audio objects are not `Send`, so they live on a dedicated thread.
    #[derive(Default)]
    pub struct SpeakerOutput {
        tx: Mutex<Option<Sender<ToneSequence>>>,
    }

    impl SpeakerOutput {
        pub fn new() -> Self {
            Self { tx: Mutex::new(None) }
        }

        fn ensure_thread(&self) -> Result<Sender<ToneSequence>> {
            let mut guard = self
                .tx
                .lock()
                .map_err(|e| ReminderError::Config(format!("audio sender poisoned: {e}")))?;
            if let Some(tx) = guard.as_ref() {
                return Ok(tx.clone());
            }

            let (tx, rx) = mpsc::channel::<ToneSequence>();
            thread::Builder::new()
                .name("alarm-audio".to_string())
                .spawn(move || {
                    let (_stream, handle) = match OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Failed to open audio output: {e}");
                            return;
                        }
                    };
                    while let Ok(sequence) = rx.recv() {
                        match Sink::try_new(&handle) {
                            Ok(sink) => {
                                sink.append(SamplesBuffer::new(1, sequence.sample_rate, sequence.samples));
                                sink.sleep_until_end();
                            }
                            Err(e) => error!("Failed to create audio sink: {e}"),
                        }
                    }
                })
                .map_err(|e| ReminderError::Config(format!("failed to spawn audio thread: {e}")))?;

            *guard = Some(tx.clone());
            Ok(tx)
        }
    }

    impl Default for SpeakerOutput {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioOutput for SpeakerOutput {
        fn play(&self, sequence: &ToneSequence) -> Result<()> {
            self.ensure_thread()?
                .send(sequence.clone())
                .map_err(|e| ReminderError::Config(format!("audio thread gone: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOutput {
        played: Mutex<usize>,
    }

    impl AudioOutput for RecordingOutput {
        fn play(&self, _sequence: &ToneSequence) -> Result<()> {
            *self.played.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn sequence_has_five_spaced_beeps() {
        let sequence = ToneSequence::alarm();
        let onsets = sequence.onsets();
        assert_eq!(onsets.len(), TONE_COUNT);
        assert_eq!(onsets[1] - onsets[0], 22_050);

        let expected = Duration::from_millis(4 * 500 + 200);
        assert!((sequence.duration().as_secs_f64() - expected.as_secs_f64()).abs() < 1e-3);

        let gap_start = onsets[0] + samples_for(TONE_LENGTH) + 10;
        assert!(sequence.samples[gap_start..onsets[1]].iter().all(|s| *s == 0.0));
        assert!(sequence.samples.iter().all(|s| s.abs() <= PEAK_GAIN));
        assert!(sequence.samples[onsets[2]..onsets[2] + 2_000].iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn alarm_is_locked_until_a_gesture() {
        let output = Arc::new(RecordingOutput::default());
        let alarm = AlarmEmitter::new(output.clone());

        assert!(matches!(alarm.play_alarm(), Err(ReminderError::AudioPolicy)));
        assert_eq!(*output.played.lock().unwrap(), 0);

        alarm.unlock();
        alarm.play_alarm().unwrap();
        alarm.play_alarm().unwrap();
        assert_eq!(*output.played.lock().unwrap(), 2);
    }
}
