//! Engine lifecycle and the dedicated audio thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::adapter::BlockAdapter;
use crate::{
    activate_device, AudioError, DeviceSelector, DeviceSession, Generator, SessionWaker,
    StreamParameters,
};

/// Drives a [`Generator`] into a system playback device.
///
/// While running, the engine owns exactly one dedicated audio thread; that
/// thread is the sole owner of the device session, the adaptation buffers and
/// the generator. The control thread touches none of them until [`stop`] has
/// joined the audio thread, so no locking is involved.
///
/// The engine can be stopped and started any number of times, possibly on a
/// different device each time. The generator's state and the adaptation
/// buffers are retained across restarts.
///
/// [`stop`]: AudioEngine::stop
pub struct AudioEngine<G: Generator> {
    params: StreamParameters,
    selector: DeviceSelector,
    stream: Option<ActiveStream<G>>,
    /// Adapter and generator between runs. `Some` exactly when `stream` is
    /// `None`.
    parked: Option<(BlockAdapter, G)>,
}

struct ActiveStream<G> {
    thread: JoinHandle<(BlockAdapter, G)>,
    stop: Arc<AtomicBool>,
    waker: Box<dyn SessionWaker>,
}

impl<G: Generator> AudioEngine<G> {
    /// Creates a stopped engine. The parameters are validated here and fixed
    /// for the engine's lifetime.
    pub fn new(params: StreamParameters, generator: G) -> Result<Self, AudioError> {
        if params.channels_count != 1 && params.channels_count != 2 {
            return Err(AudioError::UnsupportedChannelCount(params.channels_count));
        }
        if params.sample_rate == 0 {
            return Err(AudioError::InvalidParameters("sample rate must be non-zero"));
        }
        if params.block_size == 0 {
            return Err(AudioError::InvalidParameters("block size must be non-zero"));
        }

        Ok(Self {
            params,
            selector: DeviceSelector::Default,
            stream: None,
            parked: Some((BlockAdapter::new(params), generator)),
        })
    }

    /// Selects the playback device used by the next [`start`](AudioEngine::start).
    pub fn set_device(&mut self, selector: DeviceSelector) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::AlreadyRunning);
        }
        self.selector = selector;
        Ok(())
    }

    /// Opens a session on the selected device and starts the audio thread.
    ///
    /// Activation and hardware buffer sizing complete on the calling thread
    /// before the audio thread exists; all failures up to that point are
    /// returned to the caller.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let session = activate_device(self.selector, self.params)?;
        let max_frames = session.max_buffer_frames();
        info!(
            "Stream activated on {:?}: hardware buffer of {} frames",
            self.selector, max_frames
        );

        let (mut adapter, generator) = self
            .parked
            .take()
            .expect("stopped engine must hold the parked stream parts");
        adapter.ensure_capacity(max_frames);
        adapter.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let waker = session.waker();
        let thread = thread::Builder::new()
            .name("audiopump-stream".to_string())
            .spawn({
                let stop = stop.clone();
                move || run_stream(session, adapter, generator, stop)
            })
            .expect("Failed to spawn the audio stream thread!");

        self.stream = Some(ActiveStream {
            thread,
            stop,
            waker,
        });
        Ok(())
    }

    /// Stops playback and joins the audio thread.
    ///
    /// The thread is woken out of its readiness wait, finishes any cycle in
    /// progress, releases the device session and exits; only then does this
    /// method return. Stopping a stopped engine is a logged no-op.
    pub fn stop(&mut self) {
        let active = match self.stream.take() {
            Some(active) => active,
            None => {
                warn!("stop() called when the engine is not running");
                return;
            }
        };

        active.stop.store(true, Ordering::Release);
        active.waker.wake();

        let parts = active
            .thread
            .join()
            .expect("The audio stream thread must not panic!");
        self.parked = Some(parts);
        info!("Stream stopped");
    }

    /// Whether the audio thread is currently running.
    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl<G: Generator> Drop for AudioEngine<G> {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.stop();
        }
    }
}

/// The audio thread body: prime, start playback, then wait / re-derive /
/// pump until the stop flag is raised.
///
/// The session is stopped and dropped here, so joining the thread guarantees
/// that no device resource is referenced anymore. The adapter and generator
/// travel back to the control thread through the join.
fn run_stream<G: Generator>(
    mut session: Box<dyn DeviceSession>,
    mut adapter: BlockAdapter,
    mut generator: G,
    stop: Arc<AtomicBool>,
) -> (BlockAdapter, G) {
    // Preload the whole hardware buffer before playback begins; starting on
    // an empty buffer is an immediate underrun.
    let max_frames = session.max_buffer_frames();
    if let Err(err) = adapter.pump(session.as_mut(), &mut generator, max_frames) {
        warn!("Priming cycle failed: {}", err);
    }

    match session.start() {
        Ok(()) => {
            while !stop.load(Ordering::Acquire) {
                session.wait_ready();
                if stop.load(Ordering::Acquire) {
                    break;
                }

                // Wake-ups can be spurious or coalesced; what counts is how
                // much space the device reports right now.
                let available = match session.available_frames() {
                    Ok(available) => available,
                    Err(err) => {
                        debug!("Available-space query failed, skipping cycle: {}", err);
                        continue;
                    }
                };
                if available == 0 {
                    continue;
                }

                if let Err(err) = adapter.pump(session.as_mut(), &mut generator, available) {
                    debug!("Device buffer unavailable, skipping cycle: {}", err);
                }
            }
            session.stop();
        }
        Err(err) => error!("Failed to start playback: {}", err),
    }

    (adapter, generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ramp_reference, MockSession, RampGenerator, SessionEvent};

    fn params() -> StreamParameters {
        StreamParameters {
            sample_rate: 48000,
            channels_count: 2,
            block_size: 512,
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        let bad_channels = StreamParameters {
            channels_count: 3,
            ..params()
        };
        assert!(matches!(
            AudioEngine::new(bad_channels, RampGenerator::new(3)),
            Err(AudioError::UnsupportedChannelCount(3))
        ));

        let zero_rate = StreamParameters {
            sample_rate: 0,
            ..params()
        };
        assert!(matches!(
            AudioEngine::new(zero_rate, RampGenerator::new(2)),
            Err(AudioError::InvalidParameters(_))
        ));

        let zero_block = StreamParameters {
            block_size: 0,
            ..params()
        };
        assert!(matches!(
            AudioEngine::new(zero_block, RampGenerator::new(2)),
            Err(AudioError::InvalidParameters(_))
        ));
    }

    #[test]
    fn configures_device_while_stopped() {
        let mut engine = AudioEngine::new(params(), RampGenerator::new(2)).unwrap();
        assert!(!engine.is_running());
        engine.set_device(DeviceSelector::Index(3)).unwrap();
        engine.set_device(DeviceSelector::Default).unwrap();

        // Stopping a stopped engine warns but must not panic.
        engine.stop();
    }

    #[test]
    fn primes_then_starts_then_stops() {
        let session = MockSession::scripted(400, 2, vec![Ok(100)]);
        let recorder = session.recorder();
        let stop = session.stop_flag();

        let mut adapter = BlockAdapter::new(params());
        adapter.ensure_capacity(400);
        run_stream(Box::new(session), adapter, RampGenerator::new(2), stop);

        assert_eq!(
            recorder.events(),
            vec![
                SessionEvent::Commit(400),
                SessionEvent::Start,
                SessionEvent::Commit(100),
                SessionEvent::Stop,
            ]
        );
        assert_eq!(recorder.written(), ramp_reference(2, 512, 500));
    }

    #[test]
    fn zero_available_is_a_no_op_cycle() {
        let session = MockSession::scripted(256, 2, vec![Ok(0), Ok(64)]);
        let recorder = session.recorder();
        let stop = session.stop_flag();

        let mut adapter = BlockAdapter::new(params());
        adapter.ensure_capacity(256);
        run_stream(Box::new(session), adapter, RampGenerator::new(2), stop);

        assert_eq!(
            recorder.events(),
            vec![
                SessionEvent::Commit(256),
                SessionEvent::Start,
                SessionEvent::Commit(64),
                SessionEvent::Stop,
            ]
        );
    }

    #[test]
    fn transient_query_failure_skips_cycle() {
        let session = MockSession::scripted(256, 2, vec![Err(()), Ok(32)]);
        let recorder = session.recorder();
        let stop = session.stop_flag();

        let mut adapter = BlockAdapter::new(params());
        adapter.ensure_capacity(256);
        run_stream(Box::new(session), adapter, RampGenerator::new(2), stop);

        assert_eq!(
            recorder.events(),
            vec![
                SessionEvent::Commit(256),
                SessionEvent::Start,
                SessionEvent::Commit(32),
                SessionEvent::Stop,
            ]
        );
    }

    #[test]
    fn region_failure_cycles_are_skipped() {
        let mut session = MockSession::scripted(128, 2, vec![Ok(64)]);
        session.fail_writable_region = true;
        let recorder = session.recorder();
        let stop = session.stop_flag();

        let mut adapter = BlockAdapter::new(params());
        adapter.ensure_capacity(128);
        run_stream(Box::new(session), adapter, RampGenerator::new(2), stop);

        // Both the priming cycle and the scripted cycle fail to acquire a
        // region; the loop carries on and shuts down cleanly.
        assert_eq!(
            recorder.events(),
            vec![SessionEvent::Start, SessionEvent::Stop]
        );
    }

    #[test]
    fn restart_retains_generator_phase_and_discards_stale_overflow() {
        // First run: a 300-frame device, cycles of 100 and 37 frames. One
        // generator block (512 frames) covers all 437 delivered frames; the
        // remaining 75 sit in the overflow region when the stream stops.
        let session = MockSession::scripted(300, 2, vec![Ok(100), Ok(37)]);
        let first_recorder = session.recorder();
        let stop = session.stop_flag();

        let mut adapter = BlockAdapter::new(params());
        adapter.ensure_capacity(300);
        let (mut adapter, generator) =
            run_stream(Box::new(session), adapter, RampGenerator::new(2), stop);

        // Restart like the engine does: buffers kept, stale overflow dropped.
        adapter.ensure_capacity(200);
        adapter.reset();

        let session = MockSession::scripted(200, 2, vec![Ok(150)]);
        let second_recorder = session.recorder();
        let stop = session.stop_flag();
        run_stream(Box::new(session), adapter, generator, stop);

        // The generator resumes at frame 512: the first run consumed one
        // block, and its 75 undelivered frames were discarded by the restart.
        let reference = ramp_reference(2, 512, 862);
        assert_eq!(first_recorder.written(), &reference[..437 * 2]);
        assert_eq!(second_recorder.written(), &reference[512 * 2..862 * 2]);
    }
}
