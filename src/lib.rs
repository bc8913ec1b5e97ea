#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod adapter;
mod alsa;
mod engine;
mod wasapi;

#[cfg(test)]
mod testing;

pub use engine::AudioEngine;

#[doc(hidden)]
pub mod prelude {
    pub use super::{AudioEngine, DeviceSelector, Generator, StreamParameters};
}

/// Parameters of an output stream.
///
/// All three values are fixed for the lifetime of a session: they are set
/// before the engine is started and cannot change while it runs.
#[derive(Copy, Clone, Debug)]
pub struct StreamParameters {
    /// Sample rate of your audio data.
    pub sample_rate: usize,
    /// Desired amount of audio channels. Must be 1 (mono) or 2 (stereo). The data
    /// delivered to the device is _interleaved_, which means that with two channels
    /// the sample layout will be like so: `LRLRLR..`, where `L` - a sample of left
    /// channel, and `R` a sample of right channel.
    pub channels_count: usize,
    /// Amount of frames the generator produces per invocation. The generator is
    /// never asked for any other amount; the engine slices and buffers its output
    /// to match whatever the device can accept on a given cycle. Smaller blocks
    /// reduce latency, but your generator must keep up with real time.
    pub block_size: usize,
}

/// Selects which output endpoint a session is opened on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The operating system's default playback device.
    Default,
    /// A playback device by enumeration index. An out-of-range index falls back
    /// to the default device.
    Index(usize),
}

/// Errors reported by the engine and the platform device sessions.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The engine is running and the requested operation needs it stopped.
    #[error("the engine is already running")]
    AlreadyRunning,
    /// Only mono and stereo streams are supported.
    #[error("unsupported channel count {0}, expected 1 or 2")]
    UnsupportedChannelCount(usize),
    /// A stream parameter was zero or otherwise unusable.
    #[error("invalid stream parameters: {0}")]
    InvalidParameters(&'static str),
    /// No audio output backend is compiled in for this platform.
    #[error("no audio output backend is available on this platform")]
    NoBackend,
    /// The platform audio API reported a failure.
    #[error("audio device error: {0}")]
    Device(String),
}

/// Produces blocks of synthesized audio.
///
/// The engine calls [`Generator::fill`] from its audio thread, always with one
/// buffer per channel and always with exactly
/// [`StreamParameters::block_size`] samples per buffer. Implementations keep
/// whatever state they need (oscillator phase, envelopes, ...) across calls;
/// that state is only ever touched by the audio thread.
pub trait Generator: Send + 'static {
    /// Fill each per-channel buffer with freshly generated samples.
    ///
    /// `outputs` holds one deinterleaved slice per channel, channel 0 first.
    fn fill(&mut self, outputs: &mut [&mut [f32]]);
}

/// One open connection to a platform playback endpoint.
///
/// This is the seam between the engine and the native audio API. A session is
/// created in a stopped state with its hardware buffer already sized; the
/// engine moves it onto the audio thread, primes it, starts it, and drops it
/// there once the stream is told to stop.
pub trait DeviceSession: Send {
    /// The largest number of frames the device can ever accept in one cycle.
    /// Fixed for the lifetime of the session.
    fn max_buffer_frames(&self) -> usize;

    /// How many frames the device can accept right now. Failure is transient;
    /// the caller is expected to skip the cycle and ask again on the next
    /// wake-up.
    fn available_frames(&mut self) -> Result<usize, AudioError>;

    /// Borrow an interleaved region with room for exactly `frames` frames.
    /// `frames` must not exceed [`DeviceSession::max_buffer_frames`]. Failure
    /// is transient and must leave the session usable.
    fn writable_region(&mut self, frames: usize) -> Result<&mut [f32], AudioError>;

    /// Hand `frames` previously written frames back to the device. Must follow
    /// a successful [`DeviceSession::writable_region`] call for the same
    /// amount.
    fn commit(&mut self, frames: usize);

    /// Block until the device signals that buffer space may have changed. The
    /// signal may be spurious or coalesced; callers re-derive the actual space
    /// with [`DeviceSession::available_frames`] after every wake-up.
    fn wait_ready(&mut self);

    /// A handle that interrupts [`DeviceSession::wait_ready`] from another
    /// thread.
    fn waker(&self) -> Box<dyn SessionWaker>;

    /// Begin playback.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop playback. The session stays alive until dropped.
    fn stop(&mut self);
}

/// Cross-thread handle that forces a [`DeviceSession::wait_ready`] wake-up.
pub trait SessionWaker: Send + Sync {
    /// Wake the session's waiting thread. Waking an already-awake session is
    /// harmless.
    fn wake(&self);
}

/// Opens a session on the selected playback device of the current platform.
pub(crate) fn activate_device(
    selector: DeviceSelector,
    params: StreamParameters,
) -> Result<Box<dyn DeviceSession>, AudioError> {
    #[cfg(target_os = "windows")]
    {
        return Ok(Box::new(wasapi::WasapiSession::activate(selector, params)?));
    }

    #[cfg(all(target_os = "linux", feature = "alsa"))]
    {
        return Ok(Box::new(alsa::AlsaSession::activate(selector, params)?));
    }

    #[allow(unreachable_code)]
    {
        let _ = (selector, params);
        Err(AudioError::NoBackend)
    }
}
