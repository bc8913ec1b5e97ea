//! Test doubles: a scripted device session that records everything committed
//! to it, and deterministic generators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::{AudioError, DeviceSession, Generator, SessionWaker};

/// Lifecycle calls observed by a [`MockSession`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    Commit(usize),
    Start,
    Stop,
}

/// What a [`MockSession`] observed. Held behind an `Arc` so tests can inspect
/// it after the session itself was consumed by a stream loop.
#[derive(Default)]
pub(crate) struct SessionRecorder {
    written: Mutex<Vec<f32>>,
    events: Mutex<Vec<SessionEvent>>,
}

impl SessionRecorder {
    pub fn written(&self) -> Vec<f32> {
        self.written.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn committed_frames(&self, channels_count: usize) -> usize {
        self.written.lock().unwrap().len() / channels_count
    }
}

/// A [`DeviceSession`] with scripted `available_frames` answers.
///
/// Once the script is exhausted, `wait_ready` raises the stop flag, so a
/// stream loop driving this session terminates after exactly the scripted
/// cycles.
pub(crate) struct MockSession {
    max_frames: usize,
    channels_count: usize,
    available_script: Vec<Result<usize, ()>>,
    next_cycle: usize,
    /// While set, `writable_region` fails like a transient device error.
    pub fail_writable_region: bool,
    staging: Vec<f32>,
    staged_frames: usize,
    pub recorder: Arc<SessionRecorder>,
    stop_flag: Arc<AtomicBool>,
}

impl MockSession {
    pub fn new(max_frames: usize, channels_count: usize) -> Self {
        Self::scripted(max_frames, channels_count, Vec::new())
    }

    pub fn scripted(
        max_frames: usize,
        channels_count: usize,
        script: Vec<Result<usize, ()>>,
    ) -> Self {
        Self {
            max_frames,
            channels_count,
            available_script: script,
            next_cycle: 0,
            fail_writable_region: false,
            staging: Vec::new(),
            staged_frames: 0,
            recorder: Arc::new(SessionRecorder::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn recorder(&self) -> Arc<SessionRecorder> {
        self.recorder.clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }
}

impl DeviceSession for MockSession {
    fn max_buffer_frames(&self) -> usize {
        self.max_frames
    }

    fn available_frames(&mut self) -> Result<usize, AudioError> {
        let entry = self.available_script.get(self.next_cycle).copied();
        self.next_cycle += 1;
        match entry {
            Some(Ok(frames)) => Ok(frames),
            Some(Err(())) => Err(AudioError::Device("scripted query failure".to_string())),
            None => Ok(0),
        }
    }

    fn writable_region(&mut self, frames: usize) -> Result<&mut [f32], AudioError> {
        if self.fail_writable_region {
            return Err(AudioError::Device("scripted region failure".to_string()));
        }
        assert!(frames <= self.max_frames);
        self.staging.clear();
        self.staging.resize(frames * self.channels_count, 0.0);
        self.staged_frames = frames;
        Ok(&mut self.staging[..])
    }

    fn commit(&mut self, frames: usize) {
        assert_eq!(frames, self.staged_frames);
        self.recorder
            .written
            .lock()
            .unwrap()
            .extend_from_slice(&self.staging);
        self.recorder
            .events
            .lock()
            .unwrap()
            .push(SessionEvent::Commit(frames));
        self.staged_frames = 0;
    }

    fn wait_ready(&mut self) {
        if self.next_cycle >= self.available_script.len() {
            self.stop_flag.store(true, Ordering::Release);
        }
    }

    fn waker(&self) -> Box<dyn SessionWaker> {
        Box::new(NoopWaker)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.recorder.events.lock().unwrap().push(SessionEvent::Start);
        Ok(())
    }

    fn stop(&mut self) {
        self.recorder.events.lock().unwrap().push(SessionEvent::Stop);
    }
}

struct NoopWaker;

impl SessionWaker for NoopWaker {
    fn wake(&self) {}
}

/// Generates a strictly increasing per-frame ramp, tagged per channel, so any
/// dropped, duplicated or reordered frame changes the output.
pub(crate) struct RampGenerator {
    channels_count: usize,
    next_frame: usize,
    pub calls: usize,
}

impl RampGenerator {
    pub fn new(channels_count: usize) -> Self {
        Self {
            channels_count,
            next_frame: 0,
            calls: 0,
        }
    }
}

impl Generator for RampGenerator {
    fn fill(&mut self, outputs: &mut [&mut [f32]]) {
        assert_eq!(outputs.len(), self.channels_count);
        self.calls += 1;
        let block_size = outputs[0].len();
        for frame in 0..block_size {
            let value = (self.next_frame + frame) as f32;
            for (channel, samples) in outputs.iter_mut().enumerate() {
                samples[frame] = value * 8.0 + channel as f32;
            }
        }
        self.next_frame += block_size;
    }
}

/// The interleaved sample sequence a fresh [`RampGenerator`] yields when run
/// block by block, truncated to `total_frames`. Computed independently of the
/// adapter so the two cannot share a bug.
pub(crate) fn ramp_reference(
    channels_count: usize,
    block_size: usize,
    total_frames: usize,
) -> Vec<f32> {
    let mut generator = RampGenerator::new(channels_count);
    let mut scratch = vec![0.0f32; block_size * channels_count];
    let mut out = Vec::new();
    while out.len() < total_frames * channels_count {
        {
            let (first, rest) = scratch.split_at_mut(block_size);
            if channels_count == 2 {
                generator.fill(&mut [first, &mut rest[..block_size]]);
            } else {
                generator.fill(&mut [first]);
            }
        }
        for frame in 0..block_size {
            for channel in 0..channels_count {
                out.push(scratch[channel * block_size + frame]);
            }
        }
    }
    out.truncate(total_frames * channels_count);
    out
}
