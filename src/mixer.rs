//! Sample-clock mixer behind the playback device
//!
//! Holds every registered buffer with the device frame it starts at, renders
//! fixed blocks by summing the voices that overlap the block, and reports the
//! voices that ran to completion. The device clock is simply the number of
//! frames rendered so far, so it stands still while nothing is being pulled.

use crate::device::PlaybackId;
use crate::pcm::PlayableBuffer;

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    end_frame: u64,
    buffer: PlayableBuffer,
}

impl Voice {
    /// Linear interpolation of the buffer at fractional source position `pos`.
    fn sample_at(&self, pos: f64) -> f32 {
        let frames = self.buffer.frames();
        let index = pos.floor() as usize;
        if index >= frames {
            return 0.0;
        }
        let frac = (pos - index as f64) as f32;
        let a = self.buffer.frame_value(index);
        let b = if index + 1 < frames {
            self.buffer.frame_value(index + 1)
        } else {
            a
        };
        a + (b - a) * frac
    }
}

pub struct Mixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    suspended: bool,
    closed: bool,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            suspended: false,
            closed: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device time in seconds.
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop every voice and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.voices.clear();
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Register `buffer` to start at `at` seconds. Times in the past start now.
    pub fn add(&mut self, id: PlaybackId, buffer: PlayableBuffer, at: f64) {
        let rate = self.sample_rate as f64;
        let at = at.max(0.0);
        let requested = (at * rate).round() as u64;
        let requested_end = ((at + buffer.duration()) * rate).round() as u64;
        // A late start shifts the whole voice; an on-time one ends exactly where
        // the next back-to-back voice begins.
        let start_frame = requested.max(self.frames_rendered);
        let end_frame = requested_end + (start_frame - requested);
        self.voices.push(Voice {
            id,
            start_frame,
            end_frame,
            buffer,
        });
    }

    /// Cut a voice off. Returns whether it was still registered.
    pub fn remove(&mut self, id: PlaybackId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Fill `out` with the next block and return the voices that finished in it.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<PlaybackId> {
        let rate = self.sample_rate as f64;
        let block_start = self.frames_rendered;

        for (i, slot) in out.iter_mut().enumerate() {
            let frame = block_start + i as u64;
            let mut acc = 0.0f32;
            for voice in &self.voices {
                if frame < voice.start_frame || frame >= voice.end_frame {
                    continue;
                }
                let pos = (frame - voice.start_frame) as f64 * voice.buffer.sample_rate() as f64 / rate;
                acc += voice.sample_at(pos);
            }
            *slot = acc.clamp(-1.0, 1.0);
        }

        self.frames_rendered += out.len() as u64;
        let end = self.frames_rendered;

        let mut finished = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame <= end {
                finished.push(v.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: f32, frames: usize, rate: u32) -> PlayableBuffer {
        PlayableBuffer::new(vec![value; frames], rate, 1)
    }

    #[test]
    fn test_clock_advances_with_rendering() {
        let mut mixer = Mixer::new(24_000);
        assert_eq!(mixer.current_time(), 0.0);
        let mut block = vec![0.0; 480];
        mixer.render(&mut block);
        assert!((mixer.current_time() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_back_to_back_voices_do_not_overlap() {
        let mut mixer = Mixer::new(100);
        mixer.add(PlaybackId(1), constant(0.25, 10, 100), 0.0);
        mixer.add(PlaybackId(2), constant(0.5, 10, 100), 0.1);

        let mut block = vec![0.0; 20];
        let finished = mixer.render(&mut block);
        assert!(block[..10].iter().all(|s| (*s - 0.25).abs() < 1e-6));
        assert!(block[10..].iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert_eq!(finished, vec![PlaybackId(1), PlaybackId(2)]);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_back_to_back_voices_share_a_boundary_at_fractional_lengths() {
        // 1000 frames at 22.05 kHz span 1088.4 device frames at 24 kHz
        let mut mixer = Mixer::new(24_000);
        let duration = constant(0.0, 1000, 22_050).duration();
        mixer.add(PlaybackId(1), constant(0.25, 1000, 22_050), 0.0);
        mixer.add(PlaybackId(2), constant(0.5, 1000, 22_050), duration);
        assert_eq!(mixer.voices[0].end_frame, mixer.voices[1].start_frame);

        let mut block = vec![0.0; 1088];
        assert_eq!(mixer.render(&mut block), vec![PlaybackId(1)]);
        assert!(block.iter().all(|s| (*s - 0.25).abs() < 1e-6));

        let mut block = vec![0.0; 1089];
        assert_eq!(mixer.render(&mut block), vec![PlaybackId(2)]);
        assert!(block.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_past_start_plays_immediately() {
        let mut mixer = Mixer::new(100);
        let mut block = vec![0.0; 50];
        mixer.render(&mut block);

        mixer.add(PlaybackId(7), constant(0.5, 10, 100), 0.0);
        let mut block = vec![0.0; 5];
        let finished = mixer.render(&mut block);
        assert!(block.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert!(finished.is_empty());
    }

    #[test]
    fn test_remove_silences_voice() {
        let mut mixer = Mixer::new(100);
        mixer.add(PlaybackId(1), constant(0.5, 100, 100), 0.0);
        assert!(mixer.remove(PlaybackId(1)));
        assert!(!mixer.remove(PlaybackId(1)));

        let mut block = vec![0.0; 10];
        assert!(mixer.render(&mut block).is_empty());
        assert!(block.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_resamples_to_device_rate() {
        // 50 frames at 50 Hz last one second on a 100 Hz device
        let mut mixer = Mixer::new(100);
        mixer.add(PlaybackId(1), constant(0.5, 50, 50), 0.0);
        let mut block = vec![0.0; 99];
        assert!(mixer.render(&mut block).is_empty());
        let mut block = vec![0.0; 1];
        assert_eq!(mixer.render(&mut block), vec![PlaybackId(1)]);
    }

    #[test]
    fn test_mix_is_clamped() {
        let mut mixer = Mixer::new(100);
        mixer.add(PlaybackId(1), constant(0.8, 10, 100), 0.0);
        mixer.add(PlaybackId(2), constant(0.8, 10, 100), 0.0);
        let mut block = vec![0.0; 10];
        mixer.render(&mut block);
        assert!(block.iter().all(|s| *s == 1.0));
    }
}
