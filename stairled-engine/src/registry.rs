use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::animation::TimelineItemSpec;
use crate::error::ConfigError;
use crate::timeline::Timeline;
use crate::Step;

/// A named animation as configured: description, timeline items, optional
/// symbolic step groups for external surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAnimationSpec {
    #[serde(default)]
    pub description: String,
    pub timeline: Vec<TimelineItemSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_groups: Option<HashMap<String, Vec<Step>>>,
}

/// A validated registry entry. Each activation instantiates a fresh
/// [`Timeline`] from the stored spec, so runs never share lifecycle state.
#[derive(Debug)]
pub struct NamedAnimation {
    pub name: String,
    pub description: String,
    pub step_groups: Option<HashMap<String, Vec<Step>>>,
    timeline: Vec<TimelineItemSpec>,
    duration_ms: u64,
}

impl NamedAnimation {
    pub fn from_spec(name: impl Into<String>, spec: NamedAnimationSpec) -> Result<Self, ConfigError> {
        for (index, item) in spec.timeline.iter().enumerate() {
            item.animation.validate().map_err(|err| match err {
                ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                    field: format!("timeline[{index}].{field}"),
                    reason,
                },
            })?;
        }
        let duration_ms = spec
            .timeline
            .iter()
            .map(|item| item.offset_ms + item.animation.duration_ms())
            .max()
            .unwrap_or(0);
        Ok(Self {
            name: name.into(),
            description: spec.description,
            step_groups: spec.step_groups,
            timeline: spec.timeline,
            duration_ms,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn timeline_spec(&self) -> &[TimelineItemSpec] {
        &self.timeline
    }

    /// A fresh, unarmed timeline instance for one run.
    pub fn instantiate(&self) -> Timeline {
        let mut timeline = Timeline::new();
        for item in &self.timeline {
            timeline.add(item.offset_ms, item.animation.build());
        }
        timeline
    }
}

/// Result of a bulk load: what made it in and what was rejected, entry by
/// entry. Rejections never abort the rest of the load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<(String, ConfigError)>,
}

/// Name to animation lookup with snapshot semantics: readers clone an `Arc`
/// of the whole map, writers build a replacement and swap it in. A start
/// that raced a reload sees either the old or the new entry, never a
/// half-replaced one.
#[derive(Default)]
pub struct AnimationRegistry {
    entries: RwLock<Arc<HashMap<String, Arc<NamedAnimation>>>>,
}

impl AnimationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces the whole registry from a configuration source.
    pub fn load_from<I>(&self, source: I) -> LoadReport
    where
        I: IntoIterator<Item = (String, NamedAnimationSpec)>,
    {
        let mut report = LoadReport::default();
        let mut entries = HashMap::new();
        for (name, spec) in source {
            match NamedAnimation::from_spec(name.clone(), spec) {
                Ok(animation) => {
                    entries.insert(name.clone(), Arc::new(animation));
                    report.loaded.push(name);
                }
                Err(err) => {
                    warn!("rejecting animation {name:?}: {err}");
                    report.rejected.push((name, err));
                }
            }
        }
        *self.write() = Arc::new(entries);
        report
    }

    pub fn get(&self, name: &str) -> Option<Arc<NamedAnimation>> {
        self.snapshot().get(name).cloned()
    }

    /// Validated single-entry replacement.
    pub fn upsert(&self, name: impl Into<String>, spec: NamedAnimationSpec) -> Result<(), ConfigError> {
        let name = name.into();
        let animation = Arc::new(NamedAnimation::from_spec(name.clone(), spec)?);
        let mut entries = self.write();
        let mut next = HashMap::clone(entries.as_ref());
        next.insert(name, animation);
        *entries = Arc::new(next);
        Ok(())
    }

    /// Removes an entry. Sensors still referencing the name go inert; the
    /// dispatcher logs that once.
    pub fn delete(&self, name: &str) -> bool {
        let mut entries = self.write();
        if !entries.contains_key(name) {
            return false;
        }
        let mut next = HashMap::clone(entries.as_ref());
        next.remove(name);
        *entries = Arc::new(next);
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<HashMap<String, Arc<NamedAnimation>>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Arc<HashMap<String, Arc<NamedAnimation>>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::AnimationSpec;
    use crate::easing::Easing;

    fn fade_spec(leds: Vec<Step>, end_brightness: u16, duration_ms: u64) -> NamedAnimationSpec {
        NamedAnimationSpec {
            description: String::new(),
            timeline: vec![TimelineItemSpec {
                offset_ms: 0,
                animation: AnimationSpec::FadeIn {
                    leds,
                    start_brightness: 0,
                    end_brightness,
                    duration_ms,
                    easing: Easing::Linear,
                },
            }],
            step_groups: None,
        }
    }

    fn broken_spec() -> NamedAnimationSpec {
        NamedAnimationSpec {
            description: String::new(),
            timeline: vec![TimelineItemSpec {
                offset_ms: 0,
                animation: AnimationSpec::Immediate {
                    leds: vec![],
                    brightness: 100,
                    duration_ms: 0,
                },
            }],
            step_groups: None,
        }
    }

    #[test]
    fn load_keeps_valid_entries_and_reports_rejects() {
        let registry = AnimationRegistry::new();
        let report = registry.load_from([
            ("good".to_string(), fade_spec(vec![1], 4000, 1000)),
            ("bad".to_string(), broken_spec()),
        ]);

        assert_eq!(report.loaded, vec!["good"]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "bad");
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
    }

    #[test]
    fn named_duration_is_max_item_end() {
        let mut spec = fade_spec(vec![1], 4000, 1000);
        spec.timeline.push(TimelineItemSpec {
            offset_ms: 800,
            animation: AnimationSpec::FadeOut {
                leds: vec![1],
                start_brightness: 4000,
                duration_ms: 500,
                easing: Easing::Linear,
            },
        });
        let animation = NamedAnimation::from_spec("sweep", spec).unwrap();
        assert_eq!(animation.duration_ms(), 1300);
        assert_eq!(animation.instantiate().duration_ms(), 1300);
    }

    #[test]
    fn instances_do_not_share_lifecycle() {
        let registry = AnimationRegistry::new();
        registry.load_from([("a".to_string(), fade_spec(vec![1], 4000, 100))]);
        let named = registry.get("a").unwrap();

        let source = crate::output::MemoryOutput::new();
        let mut first = named.instantiate();
        first.set_absolute_start(0);
        first.set_current(500, &source);
        assert!(first.items()[0].animation.is_ended());

        let second = named.instantiate();
        assert!(!second.items()[0].animation.has_started());
    }

    #[test]
    fn upsert_replaces_one_entry() {
        let registry = AnimationRegistry::new();
        registry.load_from([("a".to_string(), fade_spec(vec![1], 4000, 100))]);

        registry.upsert("a", fade_spec(vec![1], 2000, 250)).unwrap();
        assert_eq!(registry.get("a").unwrap().duration_ms(), 250);

        assert!(registry.upsert("b", broken_spec()).is_err());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn delete_removes_entry() {
        let registry = AnimationRegistry::new();
        registry.load_from([("a".to_string(), fade_spec(vec![1], 4000, 100))]);

        assert!(registry.delete("a"));
        assert!(!registry.delete("a"));
        assert!(registry.get("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn named_specs_survive_a_serde_round_trip() {
        let spec = fade_spec(vec![1, 2, 3], 4000, 1000);
        let json = serde_json::to_string(&spec).unwrap();
        let reparsed: NamedAnimationSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, spec);
        NamedAnimation::from_spec("round", reparsed).unwrap();
    }
}
