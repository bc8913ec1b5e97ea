//! Adaptation of fixed-size generator blocks to variable-size device buffers.

use crate::{AudioError, DeviceSession, Generator, StreamParameters};

/// Bridges a [`Generator`] that only produces whole blocks to a device that
/// accepts an arbitrary number of frames on every cycle.
///
/// Each cycle first drains samples left over from the previous cycle, then
/// generates whole blocks, spilling whatever does not fit into the overflow
/// region for the next cycle. The overflow region therefore never holds a full
/// block: `0 <= overflow_frames < block_size` between cycles.
pub(crate) struct BlockAdapter {
    /// Interleaved samples generated on an earlier cycle that did not fit into
    /// the device buffer then. Sized from the hardware maximum and kept as a
    /// high-water mark across sessions.
    overflow: Vec<f32>,
    overflow_frames: usize,
    /// Deinterleaved generator output, one contiguous run of `block_size`
    /// samples per channel.
    scratch: Vec<f32>,
    block_size: usize,
    channels_count: usize,
}

impl BlockAdapter {
    pub(crate) fn new(params: StreamParameters) -> Self {
        let StreamParameters {
            channels_count,
            block_size,
            ..
        } = params;
        Self {
            overflow: vec![0.0; block_size * channels_count],
            overflow_frames: 0,
            scratch: vec![0.0; block_size * channels_count],
            block_size,
            channels_count,
        }
    }

    /// Grows the overflow region to cover a device buffer of
    /// `max_device_frames`. The allocation is never shrunk: restarting on a
    /// device with a smaller buffer keeps the larger region, avoiding churn
    /// across repeated stop/start cycles.
    pub(crate) fn ensure_capacity(&mut self, max_device_frames: usize) {
        let samples = max_device_frames * self.channels_count;
        if self.overflow.len() < samples {
            self.overflow.resize(samples, 0.0);
        }
    }

    /// Discards buffered leftovers. Called when a new session starts; samples
    /// generated for a session that has ended are stale.
    pub(crate) fn reset(&mut self) {
        self.overflow_frames = 0;
    }

    /// Produces exactly `frames` interleaved frames into the session's
    /// writable region and commits them.
    ///
    /// Failure to acquire the region is transient: the cycle is aborted with
    /// no partial commit and no state change, and the caller retries on its
    /// next wake-up.
    pub(crate) fn pump(
        &mut self,
        session: &mut dyn DeviceSession,
        generator: &mut dyn Generator,
        frames: usize,
    ) -> Result<(), AudioError> {
        if frames == 0 {
            return Ok(());
        }
        debug_assert!(frames <= session.max_buffer_frames());

        let channels_count = self.channels_count;
        let block_size = self.block_size;
        let out = session.writable_region(frames)?;
        debug_assert_eq!(out.len(), frames * channels_count);

        let mut remaining = frames;
        let mut written = 0;

        // Leftovers are stored interleaved, so draining them is a plain copy.
        if self.overflow_frames > 0 {
            let taken = self.overflow_frames.min(remaining);
            let samples = taken * channels_count;
            out[..samples].copy_from_slice(&self.overflow[..samples]);
            if taken < self.overflow_frames {
                // The request was smaller than the leftover; the unplayed tail
                // moves to the front for the next cycle.
                self.overflow
                    .copy_within(samples..self.overflow_frames * channels_count, 0);
            }
            self.overflow_frames -= taken;
            remaining -= taken;
            written = samples;
            debug_assert!(remaining < frames);
        }

        while remaining > 0 {
            debug_assert_eq!(self.overflow_frames, 0);

            {
                let (first, rest) = self.scratch.split_at_mut(block_size);
                if channels_count == 2 {
                    generator.fill(&mut [first, &mut rest[..block_size]]);
                } else {
                    generator.fill(&mut [first]);
                }
            }

            let consumed = remaining.min(block_size);
            interleave(
                &mut out[written..],
                &self.scratch,
                block_size,
                channels_count,
                0,
                consumed,
            );

            // Whatever the block produced beyond the request is spilled for
            // the next cycle. The drain above guarantees the region is free.
            let leftover = block_size - consumed;
            interleave(
                &mut self.overflow,
                &self.scratch,
                block_size,
                channels_count,
                consumed,
                leftover,
            );
            self.overflow_frames = leftover;

            remaining -= consumed;
            written += consumed * channels_count;
        }

        debug_assert!(self.overflow_frames < block_size);
        session.commit(frames);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_overflow_frames(&self) -> usize {
        self.overflow_frames
    }

    #[cfg(test)]
    pub(crate) fn overflow_region_frames(&self) -> usize {
        self.overflow.len() / self.channels_count
    }
}

/// Interleaves `frame_count` frames starting at `first_frame` of the
/// deinterleaved per-channel runs in `scratch` into `dst`, channel 0 first.
/// The only place where output sample ordering is decided.
fn interleave(
    dst: &mut [f32],
    scratch: &[f32],
    block_size: usize,
    channels_count: usize,
    first_frame: usize,
    frame_count: usize,
) {
    for frame in 0..frame_count {
        for channel in 0..channels_count {
            dst[frame * channels_count + channel] =
                scratch[channel * block_size + first_frame + frame];
        }
    }
}
