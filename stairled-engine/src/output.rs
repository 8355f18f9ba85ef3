use std::sync::Mutex;

use stairled_driver::mapper::PinMapper;

use crate::{Brightness, Frame, Step};

/// Read side of the last-written brightness state. `FadeTo` snapshots its
/// starting levels from here when it first becomes active.
pub trait BrightnessSource {
    /// Last written brightness; 0 for steps never written.
    fn brightness_of(&self, step: Step) -> Brightness;
}

/// Where the engine's rendered frames go.
pub trait LightOutput: BrightnessSource + Send + Sync {
    /// Writes one merged frame. Steps absent from the frame keep their
    /// previous level.
    fn apply_frame(&self, frame: &Frame);

    /// Everything dark.
    fn clear_all(&self);
}

impl BrightnessSource for PinMapper {
    fn brightness_of(&self, step: Step) -> Brightness {
        PinMapper::brightness_of(self, step)
    }
}

impl LightOutput for PinMapper {
    fn apply_frame(&self, frame: &Frame) {
        PinMapper::apply_frame(self, frame);
    }

    fn clear_all(&self) {
        self.set_all(0);
    }
}

/// Hardware-free output double. Records per-step levels and the write log.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    levels: Frame,
    writes: Vec<(Step, Brightness)>,
    clears: usize,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a level, as if an earlier run had written it.
    pub fn seed(&self, step: Step, value: Brightness) {
        self.state.lock().unwrap().levels.insert(step, value);
    }

    pub fn levels(&self) -> Frame {
        self.state.lock().unwrap().levels.clone()
    }

    pub fn level(&self, step: Step) -> Brightness {
        self.brightness_of(step)
    }

    pub fn writes(&self) -> Vec<(Step, Brightness)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clears(&self) -> usize {
        self.state.lock().unwrap().clears
    }
}

impl BrightnessSource for MemoryOutput {
    fn brightness_of(&self, step: Step) -> Brightness {
        self.state
            .lock()
            .unwrap()
            .levels
            .get(&step)
            .copied()
            .unwrap_or(0)
    }
}

impl LightOutput for MemoryOutput {
    fn apply_frame(&self, frame: &Frame) {
        let mut state = self.state.lock().unwrap();
        for (&step, &value) in frame {
            state.levels.insert(step, value);
            state.writes.push((step, value));
        }
    }

    fn clear_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.clears += 1;
        for value in state.levels.values_mut() {
            *value = 0;
        }
    }
}
