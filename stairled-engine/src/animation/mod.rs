mod spec;

pub use spec::{AnimationSpec, TimelineItemSpec};

use std::collections::BTreeMap;

use crate::easing::Easing;
use crate::output::BrightnessSource;
use crate::timeline::Timeline;
use crate::{Brightness, Frame, Step, MAX_BRIGHTNESS};

/// One armed brightness generator.
///
/// Lifecycle is monotonic: `started` latches on first activation, `active`
/// tracks the inclusive `[absolute_start, absolute_end]` window, `ended`
/// latches once the window is behind us. `tick` drives the flags, `render`
/// is pure in the elapsed time and the configuration (plus any snapshot
/// captured on start).
#[derive(Debug, Clone)]
pub struct Animation {
    kind: Kind,
    duration_ms: u64,
    easing: Easing,
    started: bool,
    active: bool,
    ended: bool,
    elapsed_ms: u64,
    absolute_start: Option<u64>,
    absolute_end: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    FadeIn {
        leds: Vec<Step>,
        from: Brightness,
        to: Brightness,
    },
    FadeOut {
        leds: Vec<Step>,
        from: Brightness,
    },
    /// Fades from whatever each step showed when the animation started.
    FadeTo {
        leds: Vec<Step>,
        target: Brightness,
        snapshot: BTreeMap<Step, Brightness>,
    },
    Immediate {
        leds: Vec<Step>,
        level: Brightness,
    },
    Sequence {
        inner: Timeline,
    },
    Shifting {
        leds: Vec<Step>,
        pattern: Vec<Brightness>,
        step_ms: u64,
        bounce: bool,
    },
}

impl Animation {
    pub(crate) fn new(kind: Kind, duration_ms: u64, easing: Easing) -> Self {
        Self {
            kind,
            duration_ms,
            easing,
            started: false,
            active: false,
            ended: false,
            elapsed_ms: 0,
            absolute_start: None,
            absolute_end: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Integer percent for introspection; rendering uses the fractional
    /// progress underneath.
    pub fn progress(&self) -> u8 {
        (self.progress_frac() * 100.0).round().min(100.0) as u8
    }

    fn progress_frac(&self) -> f32 {
        if self.duration_ms == 0 {
            if self.started {
                1.0
            } else {
                0.0
            }
        } else {
            self.elapsed_ms as f32 / self.duration_ms as f32
        }
    }

    /// Pins the animation to an absolute start on the engine clock.
    pub fn set_absolute_start(&mut self, t0_ms: u64) {
        self.absolute_start = Some(t0_ms);
        self.absolute_end = Some(t0_ms + self.duration_ms);
        if let Kind::Sequence { inner } = &mut self.kind {
            inner.set_absolute_start(t0_ms);
        }
    }

    /// Clears lifecycle and absolute times, keeping the configuration.
    pub fn reset(&mut self) {
        self.started = false;
        self.active = false;
        self.ended = false;
        self.elapsed_ms = 0;
        self.absolute_start = None;
        self.absolute_end = None;
        match &mut self.kind {
            Kind::FadeTo { snapshot, .. } => snapshot.clear(),
            Kind::Sequence { inner } => inner.reset(),
            _ => {}
        }
    }

    /// Advances lifecycle flags and elapsed time to `now_ms`. The first
    /// activating tick runs `on_start`, which may snapshot observed state
    /// from `source`.
    pub fn tick(&mut self, now_ms: u64, source: &dyn BrightnessSource) {
        let (Some(start), Some(end)) = (self.absolute_start, self.absolute_end) else {
            return;
        };

        if now_ms < start {
            self.active = false;
            self.elapsed_ms = 0;
        } else if now_ms <= end {
            self.enter(source);
            self.elapsed_ms = now_ms - start;
            self.active = true;
        } else if self.duration_ms == 0 && !self.started {
            // a zero-length animation still gets its one rendered tick
            self.enter(source);
            self.elapsed_ms = 0;
            self.active = true;
        } else {
            self.elapsed_ms = self.duration_ms;
            self.active = false;
            self.ended = true;
        }

        if let Kind::Sequence { inner } = &mut self.kind {
            inner.set_current(now_ms, source);
        }
    }

    fn enter(&mut self, source: &dyn BrightnessSource) {
        if self.started {
            return;
        }
        self.started = true;
        if let Kind::FadeTo { leds, snapshot, .. } = &mut self.kind {
            for &led in leds.iter() {
                snapshot.insert(led, source.brightness_of(led));
            }
        }
    }

    /// Brightness per step for the current progress. Never mutates external
    /// state; only reads configuration and the start snapshot.
    pub fn render(&self) -> Frame {
        let eased = self.easing.apply(self.progress_frac());
        let mut frame = Frame::new();
        match &self.kind {
            Kind::FadeIn { leds, from, to } => {
                for &led in leds {
                    frame.insert(led, lerp(*from, *to, eased));
                }
            }
            Kind::FadeOut { leds, from } => {
                for &led in leds {
                    frame.insert(led, lerp(*from, 0, eased));
                }
            }
            Kind::FadeTo {
                leds,
                target,
                snapshot,
            } => {
                for &led in leds {
                    let from = snapshot.get(&led).copied().unwrap_or(0);
                    frame.insert(led, lerp(from, *target, eased));
                }
            }
            Kind::Immediate { leds, level } => {
                for &led in leds {
                    frame.insert(led, *level);
                }
            }
            Kind::Sequence { inner } => return inner.render_active(),
            Kind::Shifting {
                leds,
                pattern,
                step_ms,
                bounce,
            } => {
                let start = shift_index(
                    (self.elapsed_ms / step_ms) as usize,
                    pattern.len(),
                    *bounce,
                );
                for (offset, &value) in pattern.iter().enumerate() {
                    let position = (start + offset) % leds.len();
                    frame.insert(leds[position], value);
                }
            }
        }
        frame
    }
}

fn lerp(from: Brightness, to: Brightness, t: f32) -> Brightness {
    let value = from as f32 + (to as f32 - from as f32) * t;
    value.round().clamp(0.0, MAX_BRIGHTNESS as f32) as Brightness
}

/// Time index into the pattern walk; a bouncing walk reflects off both ends
/// as a triangular wave.
fn shift_index(index: usize, pattern_len: usize, bounce: bool) -> usize {
    if pattern_len == 0 {
        return 0;
    }
    if !bounce {
        return index.min(pattern_len - 1);
    }
    let period = 2 * pattern_len.saturating_sub(1);
    if period == 0 {
        return 0;
    }
    let phase = index % period;
    if phase < pattern_len {
        phase
    } else {
        period - phase
    }
}
