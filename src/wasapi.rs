//! Windows device session via `WASAPI`.

#![cfg(target_os = "windows")]

use crate::{AudioError, DeviceSelector, DeviceSession, SessionWaker, StreamParameters};
use log::{info, warn};
use std::{
    mem::size_of,
    ptr::{null, null_mut},
    sync::Arc,
};
use winapi::{
    shared::{
        guiddef::GUID,
        minwindef::{BYTE, DWORD, WORD},
        mmreg::{WAVEFORMATEX, WAVEFORMATEXTENSIBLE, WAVE_FORMAT_EXTENSIBLE},
        winerror::{FAILED, HRESULT, RPC_E_CHANGED_MODE},
    },
    um::{
        audioclient::{IAudioClient, IAudioRenderClient},
        audiosessiontypes::{AUDCLNT_SHAREMODE_SHARED, AUDCLNT_STREAMFLAGS_EVENTCALLBACK},
        combaseapi::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL},
        handleapi::CloseHandle,
        mmdeviceapi::{
            eMultimedia, eRender, IMMDevice, IMMDeviceCollection, IMMDeviceEnumerator,
            DEVICE_STATE_ACTIVE,
        },
        objbase::COINIT_MULTITHREADED,
        synchapi::{CreateEventA, SetEvent, WaitForSingleObject},
        winbase::INFINITE,
        winnt::HANDLE,
    },
    Interface,
};

// Declare the pieces the binding lacks.
const AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM: DWORD = 0x8000_0000;
const AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY: DWORD = 0x0800_0000;
const SPEAKER_FRONT_LEFT: DWORD = 0x1;
const SPEAKER_FRONT_RIGHT: DWORD = 0x2;
const SPEAKER_FRONT_CENTER: DWORD = 0x4;

const CLSID_MM_DEVICE_ENUMERATOR: GUID = GUID {
    Data1: 0xbcde_0395,
    Data2: 0xe52f,
    Data3: 0x467c,
    Data4: [0x8e, 0x3d, 0xc4, 0x57, 0x92, 0x91, 0x69, 0x2e],
};
const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: GUID = GUID {
    Data1: 0x0000_0003,
    Data2: 0x0000,
    Data3: 0x0010,
    Data4: [0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71],
};

pub struct WasapiSession {
    audio_client: *mut IAudioClient,
    render_client: *mut IAudioRenderClient,
    event: Arc<EventHandle>,
    max_frames: usize,
    channels_count: usize,
}

unsafe impl Send for WasapiSession {}

fn check(hr: HRESULT, message: &str) -> Result<(), AudioError> {
    if FAILED(hr) {
        Err(AudioError::Device(format!(
            "{} (HRESULT 0x{:08x})",
            message, hr as u32
        )))
    } else {
        Ok(())
    }
}

/// Per-thread COM initialization. An apartment already initialized in a
/// different mode is fine for the calls made here; process-level COM teardown
/// is the application's business.
fn ensure_com_initialized() -> Result<(), AudioError> {
    let hr = unsafe { CoInitializeEx(null_mut(), COINIT_MULTITHREADED) };
    if FAILED(hr) && hr != RPC_E_CHANGED_MODE {
        return Err(AudioError::Device(format!(
            "Failed to initialize COM (HRESULT 0x{:08x})",
            hr as u32
        )));
    }
    Ok(())
}

/// Picks the render endpoint for `selector`. An out-of-range index falls
/// back to the default multimedia endpoint.
unsafe fn resolve_endpoint(
    enumerator: *mut IMMDeviceEnumerator,
    selector: DeviceSelector,
) -> Result<*mut IMMDevice, AudioError> {
    let mut device: *mut IMMDevice = null_mut();

    if let DeviceSelector::Index(index) = selector {
        let mut collection: *mut IMMDeviceCollection = null_mut();
        check(
            (*enumerator).EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE, &mut collection),
            "Failed to enumerate playback endpoints",
        )?;

        let mut count = 0u32;
        (*collection).GetCount(&mut count);
        if (index as u32) < count {
            (*collection).Item(index as u32, &mut device);
        } else {
            warn!(
                "Playback device index {} is out of range ({} endpoints), using the default device",
                index, count
            );
        }
        (*collection).Release();
    }

    if device.is_null() {
        check(
            (*enumerator).GetDefaultAudioEndpoint(eRender, eMultimedia, &mut device),
            "Failed to get the default playback endpoint",
        )?;
    }

    Ok(device)
}

impl WasapiSession {
    pub fn activate(
        selector: DeviceSelector,
        params: StreamParameters,
    ) -> Result<Self, AudioError> {
        ensure_com_initialized()?;

        unsafe {
            let mut enumerator: *mut IMMDeviceEnumerator = null_mut();
            check(
                CoCreateInstance(
                    &CLSID_MM_DEVICE_ENUMERATOR,
                    null_mut(),
                    CLSCTX_ALL,
                    &IMMDeviceEnumerator::uuidof(),
                    &mut enumerator as *mut *mut _ as *mut _,
                ),
                "Failed to create the device enumerator",
            )?;

            let device = resolve_endpoint(enumerator, selector);
            (*enumerator).Release();
            let device = device?;

            let mut audio_client: *mut IAudioClient = null_mut();
            let hr = (*device).Activate(
                &IAudioClient::uuidof(),
                CLSCTX_ALL,
                null_mut(),
                &mut audio_client as *mut *mut _ as *mut _,
            );
            (*device).Release();
            check(hr, "Failed to activate the audio client")?;

            let channel_mask = if params.channels_count == 1 {
                SPEAKER_FRONT_CENTER
            } else {
                SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT
            };

            let bytes_per_frame = params.channels_count * size_of::<f32>();
            let format = WAVEFORMATEXTENSIBLE {
                Format: WAVEFORMATEX {
                    wFormatTag: WAVE_FORMAT_EXTENSIBLE,
                    nChannels: params.channels_count as WORD,
                    nSamplesPerSec: params.sample_rate as DWORD,
                    nAvgBytesPerSec: (params.sample_rate * bytes_per_frame) as DWORD,
                    nBlockAlign: bytes_per_frame as WORD,
                    wBitsPerSample: 32,
                    cbSize: 22,
                },
                Samples: 32,
                dwChannelMask: channel_mask,
                SubFormat: KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
            };

            // One block of buffer duration, in 100 ns units.
            let buffer_duration =
                (params.block_size as i64 * 10_000_000) / params.sample_rate as i64;

            check(
                (*audio_client).Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK
                        | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                        | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY,
                    buffer_duration,
                    0,
                    &format as *const _ as *const WAVEFORMATEX,
                    null(),
                ),
                "Failed to initialize the audio client",
            )?;

            let mut max_frames = 0u32;
            check(
                (*audio_client).GetBufferSize(&mut max_frames),
                "Failed to query the hardware buffer size",
            )?;

            let mut render_client: *mut IAudioRenderClient = null_mut();
            check(
                (*audio_client).GetService(
                    &IAudioRenderClient::uuidof(),
                    &mut render_client as *mut *mut _ as *mut _,
                ),
                "Failed to obtain the render client",
            )?;

            let event = CreateEventA(null_mut(), 0, 0, null());
            if event.is_null() {
                return Err(AudioError::Device(
                    "Failed to create the readiness event".to_string(),
                ));
            }
            check(
                (*audio_client).SetEventHandle(event),
                "Failed to attach the readiness event",
            )?;

            info!(
                "WASAPI stream ready: hardware buffer of {} frames at {} Hz",
                max_frames, params.sample_rate
            );

            Ok(Self {
                audio_client,
                render_client,
                event: Arc::new(EventHandle(event)),
                max_frames: max_frames as usize,
                channels_count: params.channels_count,
            })
        }
    }
}

impl DeviceSession for WasapiSession {
    fn max_buffer_frames(&self) -> usize {
        self.max_frames
    }

    fn available_frames(&mut self) -> Result<usize, AudioError> {
        let mut padding = 0u32;
        let hr = unsafe { (*self.audio_client).GetCurrentPadding(&mut padding) };
        check(hr, "Failed to query the device padding")?;
        debug_assert!(padding as usize <= self.max_frames);
        Ok(self.max_frames.saturating_sub(padding as usize))
    }

    fn writable_region(&mut self, frames: usize) -> Result<&mut [f32], AudioError> {
        debug_assert!(frames <= self.max_frames);
        let mut data: *mut BYTE = null_mut();
        let hr = unsafe { (*self.render_client).GetBuffer(frames as u32, &mut data) };
        if FAILED(hr) || data.is_null() {
            return Err(AudioError::Device(format!(
                "Failed to acquire {} writable frames (HRESULT 0x{:08x})",
                frames, hr as u32
            )));
        }
        // The shared-mode buffer carries the float format negotiated above.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(data as *mut f32, frames * self.channels_count)
        })
    }

    fn commit(&mut self, frames: usize) {
        unsafe {
            (*self.render_client).ReleaseBuffer(frames as u32, 0);
        }
    }

    fn wait_ready(&mut self) {
        unsafe {
            WaitForSingleObject(self.event.0, INFINITE);
        }
    }

    fn waker(&self) -> Box<dyn SessionWaker> {
        Box::new(WasapiWaker {
            event: self.event.clone(),
        })
    }

    fn start(&mut self) -> Result<(), AudioError> {
        check(
            unsafe { (*self.audio_client).Start() },
            "Failed to start the stream",
        )
    }

    fn stop(&mut self) {
        unsafe {
            (*self.audio_client).Stop();
        }
    }
}

impl Drop for WasapiSession {
    fn drop(&mut self) {
        unsafe {
            (*self.render_client).Release();
            (*self.audio_client).Release();
        }
    }
}

/// Owns the readiness event. Shared between the session and its waker so the
/// handle stays valid for whichever of the two is dropped last.
struct EventHandle(HANDLE);

unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

impl Drop for EventHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

struct WasapiWaker {
    event: Arc<EventHandle>,
}

impl SessionWaker for WasapiWaker {
    fn wake(&self) {
        unsafe {
            SetEvent(self.event.0);
        }
    }
}
