use crate::animation::Animation;
use crate::output::BrightnessSource;
use crate::Frame;

/// An animation plus its start offset inside the container.
#[derive(Debug, Clone)]
pub struct TimelineItem {
    pub offset_ms: u64,
    pub animation: Animation,
}

/// Ordered collection of animations sharing one absolute start time.
///
/// Items are keyed by insertion order; when two active items render the
/// same step in a tick, the later insertion wins.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    items: Vec<TimelineItem>,
    duration_ms: u64,
    started_at: Option<u64>,
    active: Vec<usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an animation at `offset_ms` and recomputes the container
    /// duration.
    pub fn add(&mut self, offset_ms: u64, animation: Animation) {
        self.duration_ms = self.duration_ms.max(offset_ms + animation.duration_ms());
        self.items.push(TimelineItem {
            offset_ms,
            animation,
        });
    }

    /// `max(offset + duration)` over all items.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn absolute_end(&self) -> Option<u64> {
        self.started_at.map(|t0| t0 + self.duration_ms)
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    /// Arms the container: every item gets `t0 + offset` as its absolute
    /// start.
    pub fn set_absolute_start(&mut self, t0_ms: u64) {
        self.started_at = Some(t0_ms);
        for item in &mut self.items {
            item.animation.set_absolute_start(t0_ms + item.offset_ms);
        }
    }

    /// Ticks every item to `now_ms` and caches which are active.
    pub fn set_current(&mut self, now_ms: u64, source: &dyn BrightnessSource) {
        self.active.clear();
        for (index, item) in self.items.iter_mut().enumerate() {
            item.animation.tick(now_ms, source);
            if item.animation.is_active() {
                self.active.push(index);
            }
        }
    }

    /// Items active as of the last `set_current`, in insertion order.
    pub fn active_items(&self) -> impl Iterator<Item = &TimelineItem> {
        self.active.iter().map(|&index| &self.items[index])
    }

    /// Merged frame of all active items; later insertions overwrite earlier
    /// ones per step.
    pub fn render_active(&self) -> Frame {
        let mut merged = Frame::new();
        for item in self.active_items() {
            merged.extend(item.animation.render());
        }
        merged
    }

    /// Disarms the container and resets every item's lifecycle, keeping the
    /// configured items.
    pub fn reset(&mut self) {
        self.started_at = None;
        self.active.clear();
        for item in &mut self.items {
            item.animation.reset();
        }
    }
}
