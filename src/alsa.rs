//! Linux device session via `alsa`.

#![cfg(all(target_os = "linux", feature = "alsa"))]

use crate::{AudioError, DeviceSelector, DeviceSession, SessionWaker, StreamParameters};
use alsa_sys::*;
use log::{info, warn};
use std::{
    ffi::{CStr, CString},
    os::raw::{c_int, c_uint, c_ulong},
};

/// Upper bound of a single readiness wait. ALSA has no portable way to
/// interrupt a sleeping `snd_pcm_wait` from another thread, so the wait is
/// bounded and the stop flag is observed on the next tick.
const READY_WAIT_MS: c_int = 100;

pub struct AlsaSession {
    playback_device: *mut snd_pcm_t,
    buffer_frames: usize,
    channels_count: usize,
    staging: Vec<f32>,
    staged_frames: usize,
}

unsafe impl Send for AlsaSession {}

fn err_code_to_string(err_code: c_int) -> String {
    unsafe {
        let message = CStr::from_ptr(snd_strerror(err_code) as *const _)
            .to_bytes()
            .to_vec();
        String::from_utf8(message).unwrap()
    }
}

fn check(err_code: c_int, message: &str) -> Result<(), AudioError> {
    if err_code < 0 {
        Err(AudioError::Device(format!(
            "{}: {}",
            message,
            err_code_to_string(err_code)
        )))
    } else {
        Ok(())
    }
}

impl AlsaSession {
    pub fn activate(
        selector: DeviceSelector,
        params: StreamParameters,
    ) -> Result<Self, AudioError> {
        let device_name = match selector {
            DeviceSelector::Default => "default".to_string(),
            // Card by number, routed through the plug layer so format and
            // rate conversion stay the device's problem.
            DeviceSelector::Index(index) => format!("plughw:{}", index),
        };
        let name = CString::new(device_name).unwrap();

        unsafe {
            let mut playback_device = std::ptr::null_mut();
            check(
                snd_pcm_open(
                    &mut playback_device,
                    name.as_ptr() as *const _,
                    SND_PCM_STREAM_PLAYBACK,
                    0,
                ),
                "Failed to open the playback device",
            )?;

            let mut hw_params = std::ptr::null_mut();
            check(
                snd_pcm_hw_params_malloc(&mut hw_params),
                "Failed to allocate hardware parameters",
            )?;
            check(
                snd_pcm_hw_params_any(playback_device, hw_params),
                "Failed to read hardware parameters",
            )?;
            check(
                snd_pcm_hw_params_set_access(
                    playback_device,
                    hw_params,
                    SND_PCM_ACCESS_RW_INTERLEAVED,
                ),
                "Failed to set interleaved access",
            )?;
            check(
                snd_pcm_hw_params_set_format(playback_device, hw_params, SND_PCM_FORMAT_FLOAT_LE),
                "Failed to set the sample format",
            )?;
            let mut exact_rate = params.sample_rate as c_uint;
            check(
                snd_pcm_hw_params_set_rate_near(
                    playback_device,
                    hw_params,
                    &mut exact_rate,
                    std::ptr::null_mut(),
                ),
                "Failed to set the sample rate",
            )?;
            check(
                snd_pcm_hw_params_set_channels(
                    playback_device,
                    hw_params,
                    params.channels_count as c_uint,
                ),
                "Failed to set the channel count",
            )?;
            let mut _exact_period = params.block_size as snd_pcm_uframes_t;
            let mut _direction = 0;
            check(
                snd_pcm_hw_params_set_period_size_near(
                    playback_device,
                    hw_params,
                    &mut _exact_period,
                    &mut _direction,
                ),
                "Failed to set the period size",
            )?;
            let mut exact_size = (params.block_size * 2) as c_ulong;
            check(
                snd_pcm_hw_params_set_buffer_size_near(
                    playback_device,
                    hw_params,
                    &mut exact_size,
                ),
                "Failed to set the buffer size",
            )?;
            check(
                snd_pcm_hw_params(playback_device, hw_params),
                "Failed to apply hardware parameters",
            )?;
            snd_pcm_hw_params_free(hw_params);

            let mut sw_params = std::ptr::null_mut();
            check(
                snd_pcm_sw_params_malloc(&mut sw_params),
                "Failed to allocate software parameters",
            )?;
            check(
                snd_pcm_sw_params_current(playback_device, sw_params),
                "Failed to read software parameters",
            )?;
            check(
                snd_pcm_sw_params_set_avail_min(
                    playback_device,
                    sw_params,
                    params.block_size as c_ulong,
                ),
                "Failed to set the wake-up threshold",
            )?;
            // Playback kicks in once the priming cycle has filled the buffer.
            check(
                snd_pcm_sw_params_set_start_threshold(playback_device, sw_params, exact_size),
                "Failed to set the start threshold",
            )?;
            check(
                snd_pcm_sw_params(playback_device, sw_params),
                "Failed to apply software parameters",
            )?;
            snd_pcm_sw_params_free(sw_params);
            check(
                snd_pcm_prepare(playback_device),
                "Failed to prepare the device",
            )?;

            let mut buffer_frames: snd_pcm_uframes_t = 0;
            let mut period_frames: snd_pcm_uframes_t = 0;
            check(
                snd_pcm_get_params(playback_device, &mut buffer_frames, &mut period_frames),
                "Failed to query the negotiated buffer sizes",
            )?;
            info!(
                "ALSA device opened: buffer of {} frames, period of {} frames",
                buffer_frames, period_frames
            );

            Ok(Self {
                playback_device,
                buffer_frames: buffer_frames as usize,
                channels_count: params.channels_count,
                staging: vec![0.0; buffer_frames as usize * params.channels_count],
                staged_frames: 0,
            })
        }
    }
}

impl DeviceSession for AlsaSession {
    fn max_buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn available_frames(&mut self) -> Result<usize, AudioError> {
        let available = unsafe { snd_pcm_avail_update(self.playback_device) };
        if available < 0 {
            // Usually an underrun; recover so the next cycle can proceed.
            unsafe { snd_pcm_recover(self.playback_device, available as c_int, 1) };
            return Err(AudioError::Device(format!(
                "Failed to query available frames: {}",
                err_code_to_string(available as c_int)
            )));
        }
        Ok((available as usize).min(self.buffer_frames))
    }

    fn writable_region(&mut self, frames: usize) -> Result<&mut [f32], AudioError> {
        debug_assert!(frames <= self.buffer_frames);
        self.staged_frames = frames;
        Ok(&mut self.staging[..frames * self.channels_count])
    }

    fn commit(&mut self, frames: usize) {
        debug_assert_eq!(frames, self.staged_frames);
        let channels_count = self.channels_count;
        let mut offset = 0;
        let mut attempts = 0;
        while offset < frames && attempts < 10 {
            unsafe {
                let written = snd_pcm_writei(
                    self.playback_device,
                    self.staging[offset * channels_count..].as_ptr() as *const _,
                    (frames - offset) as snd_pcm_uframes_t,
                );
                if written < 0 {
                    // Try to recover from any errors and re-send data.
                    attempts += 1;
                    snd_pcm_recover(self.playback_device, written as c_int, 1);
                } else {
                    offset += written as usize;
                }
            }
        }
        if offset < frames {
            warn!(
                "Device refused {} of {} committed frames",
                frames - offset,
                frames
            );
        }
        self.staged_frames = 0;
    }

    fn wait_ready(&mut self) {
        let ready = unsafe { snd_pcm_wait(self.playback_device, READY_WAIT_MS) };
        if ready < 0 {
            unsafe { snd_pcm_recover(self.playback_device, ready, 1) };
        }
    }

    fn waker(&self) -> Box<dyn SessionWaker> {
        Box::new(AlsaWaker)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        // The start threshold normally kicks playback off as the priming
        // cycle completes; start explicitly in case priming wrote less.
        let state = unsafe { snd_pcm_state(self.playback_device) };
        if state == SND_PCM_STATE_PREPARED {
            check(
                unsafe { snd_pcm_start(self.playback_device) },
                "Failed to start playback",
            )?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        unsafe {
            snd_pcm_drop(self.playback_device);
        }
    }
}

impl Drop for AlsaSession {
    fn drop(&mut self) {
        unsafe {
            snd_pcm_close(self.playback_device);
        }
    }
}

/// `wait_ready` is bounded, so there is nothing to interrupt; the stop flag
/// is seen on the next tick.
struct AlsaWaker;

impl SessionWaker for AlsaWaker {
    fn wake(&self) {}
}
