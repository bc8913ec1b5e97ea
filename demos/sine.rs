//! Plays a 500 Hz sine wave on the default output device for five seconds.

use audiopump::prelude::*;

struct SineOscillator {
    phase: f32,
    increment: f32,
}

impl Generator for SineOscillator {
    fn fill(&mut self, outputs: &mut [&mut [f32]]) {
        for frame in 0..outputs[0].len() {
            let sample = (self.phase * 2.0 * std::f32::consts::PI).sin();
            for channel in outputs.iter_mut() {
                channel[frame] = sample;
            }
            self.phase += self.increment;
            self.phase -= self.phase.floor();
        }
    }
}

fn main() -> Result<(), audiopump::AudioError> {
    env_logger::init();

    let params = StreamParameters {
        sample_rate: 48000,
        channels_count: 2,
        block_size: 512,
    };

    let oscillator = SineOscillator {
        phase: 0.0,
        increment: 500.0 / params.sample_rate as f32,
    };

    let mut engine = AudioEngine::new(params, oscillator)?;
    engine.set_device(DeviceSelector::Default)?;
    engine.start()?;

    std::thread::sleep(std::time::Duration::from_secs(5));

    engine.stop();
    Ok(())
}
