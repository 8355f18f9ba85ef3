use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::animation::{Animation, Kind};
use crate::easing::Easing;
use crate::error::ConfigError;
use crate::timeline::Timeline;
use crate::{Brightness, Step, MAX_BRIGHTNESS};

/// One entry of a configured timeline: an animation armed at a relative
/// offset from the container's start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItemSpec {
    #[serde(default)]
    pub offset_ms: u64,
    #[serde(flatten)]
    pub animation: AnimationSpec,
}

/// Declarative animation variants as they appear in configuration. Variant
/// dispatch happens here, at the parse edge; the runtime side is the
/// [`Animation`] built from a validated spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnimationSpec {
    FadeIn {
        leds: Vec<Step>,
        start_brightness: Brightness,
        end_brightness: Brightness,
        duration_ms: u64,
        #[serde(default)]
        easing: Easing,
    },
    /// Fades to zero.
    FadeOut {
        leds: Vec<Step>,
        start_brightness: Brightness,
        duration_ms: u64,
        #[serde(default)]
        easing: Easing,
    },
    /// Fades from the brightness observed when the animation starts.
    FadeTo {
        leds: Vec<Step>,
        target_brightness: Brightness,
        duration_ms: u64,
        #[serde(default)]
        easing: Easing,
    },
    Immediate {
        leds: Vec<Step>,
        brightness: Brightness,
        #[serde(default)]
        duration_ms: u64,
    },
    /// Ordered, possibly overlapping inner animations.
    Sequence { items: Vec<TimelineItemSpec> },
    /// Walks a brightness pattern along the led list over time. Easing does
    /// not apply; the index arithmetic is discrete.
    Shifting {
        leds: Vec<Step>,
        pattern: Vec<Brightness>,
        step_ms: u64,
        #[serde(default)]
        bounce: bool,
    },
}

impl AnimationSpec {
    /// Construction-time validation. Violations reject this entity only;
    /// callers keep loading their remaining entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AnimationSpec::FadeIn {
                leds,
                start_brightness,
                end_brightness,
                ..
            } => {
                check_leds(leds)?;
                check_brightness("start_brightness", *start_brightness)?;
                check_brightness("end_brightness", *end_brightness)
            }
            AnimationSpec::FadeOut {
                leds,
                start_brightness,
                ..
            } => {
                check_leds(leds)?;
                check_brightness("start_brightness", *start_brightness)
            }
            AnimationSpec::FadeTo {
                leds,
                target_brightness,
                ..
            } => {
                check_leds(leds)?;
                check_brightness("target_brightness", *target_brightness)
            }
            AnimationSpec::Immediate {
                leds, brightness, ..
            } => {
                check_leds(leds)?;
                check_brightness("brightness", *brightness)
            }
            AnimationSpec::Sequence { items } => {
                for (index, item) in items.iter().enumerate() {
                    item.animation.validate().map_err(|err| match err {
                        ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                            field: format!("items[{index}].{field}"),
                            reason,
                        },
                    })?;
                }
                Ok(())
            }
            AnimationSpec::Shifting {
                leds,
                pattern,
                step_ms,
                ..
            } => {
                check_leds(leds)?;
                if pattern.is_empty() {
                    return Err(ConfigError::invalid("pattern", "must not be empty"));
                }
                if let Some(value) = pattern.iter().find(|&&v| v > MAX_BRIGHTNESS) {
                    return Err(ConfigError::invalid(
                        "pattern",
                        format!("value {value} exceeds {MAX_BRIGHTNESS}"),
                    ));
                }
                if *step_ms == 0 {
                    return Err(ConfigError::invalid("step_ms", "must be at least 1"));
                }
                Ok(())
            }
        }
    }

    /// Deterministic duration. Declared for the leaf variants, computed for
    /// `Sequence` (max inner end) and `Shifting` (pattern walk length,
    /// doubled when bouncing).
    pub fn duration_ms(&self) -> u64 {
        match self {
            AnimationSpec::FadeIn { duration_ms, .. }
            | AnimationSpec::FadeOut { duration_ms, .. }
            | AnimationSpec::FadeTo { duration_ms, .. }
            | AnimationSpec::Immediate { duration_ms, .. } => *duration_ms,
            AnimationSpec::Sequence { items } => items
                .iter()
                .map(|item| item.offset_ms + item.animation.duration_ms())
                .max()
                .unwrap_or(0),
            AnimationSpec::Shifting {
                pattern,
                step_ms,
                bounce,
                ..
            } => pattern.len() as u64 * step_ms * if *bounce { 2 } else { 1 },
        }
    }

    /// Builds the runtime animation. Call after [`AnimationSpec::validate`].
    pub fn build(&self) -> Animation {
        let duration_ms = self.duration_ms();
        match self {
            AnimationSpec::FadeIn {
                leds,
                start_brightness,
                end_brightness,
                easing,
                ..
            } => Animation::new(
                Kind::FadeIn {
                    leds: leds.clone(),
                    from: *start_brightness,
                    to: *end_brightness,
                },
                duration_ms,
                *easing,
            ),
            AnimationSpec::FadeOut {
                leds,
                start_brightness,
                easing,
                ..
            } => Animation::new(
                Kind::FadeOut {
                    leds: leds.clone(),
                    from: *start_brightness,
                },
                duration_ms,
                *easing,
            ),
            AnimationSpec::FadeTo {
                leds,
                target_brightness,
                easing,
                ..
            } => Animation::new(
                Kind::FadeTo {
                    leds: leds.clone(),
                    target: *target_brightness,
                    snapshot: BTreeMap::new(),
                },
                duration_ms,
                *easing,
            ),
            AnimationSpec::Immediate {
                leds, brightness, ..
            } => Animation::new(
                Kind::Immediate {
                    leds: leds.clone(),
                    level: *brightness,
                },
                duration_ms,
                Easing::Linear,
            ),
            AnimationSpec::Sequence { items } => {
                let mut inner = Timeline::new();
                for item in items {
                    inner.add(item.offset_ms, item.animation.build());
                }
                Animation::new(Kind::Sequence { inner }, duration_ms, Easing::Linear)
            }
            AnimationSpec::Shifting {
                leds,
                pattern,
                step_ms,
                bounce,
            } => Animation::new(
                Kind::Shifting {
                    leds: leds.clone(),
                    pattern: pattern.clone(),
                    step_ms: *step_ms,
                    bounce: *bounce,
                },
                duration_ms,
                Easing::Linear,
            ),
        }
    }
}

fn check_leds(leds: &[Step]) -> Result<(), ConfigError> {
    if leds.is_empty() {
        return Err(ConfigError::invalid("leds", "must not be empty"));
    }
    if leds.contains(&0) {
        return Err(ConfigError::invalid("leds", "step numbers start at 1"));
    }
    Ok(())
}

fn check_brightness(field: &str, value: Brightness) -> Result<(), ConfigError> {
    if value > MAX_BRIGHTNESS {
        return Err(ConfigError::invalid(
            field,
            format!("{value} exceeds {MAX_BRIGHTNESS}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fade_in_json() -> &'static str {
        r#"{
            "type": "fade_in",
            "leds": [1, 2],
            "start_brightness": 0,
            "end_brightness": 4000,
            "duration_ms": 1000
        }"#
    }

    #[test]
    fn parses_tagged_variant_with_default_easing() {
        let spec: AnimationSpec = serde_json::from_str(fade_in_json()).unwrap();
        assert!(matches!(
            spec,
            AnimationSpec::FadeIn {
                easing: Easing::Linear,
                ..
            }
        ));
        assert_eq!(spec.duration_ms(), 1000);
        spec.validate().unwrap();
    }

    #[test]
    fn rejects_empty_leds() {
        let spec = AnimationSpec::Immediate {
            leds: vec![],
            brightness: 100,
            duration_ms: 0,
        };
        let err = spec.validate().unwrap_err();
        assert_eq!(
            err,
            ConfigError::invalid("leds", "must not be empty")
        );
    }

    #[test]
    fn rejects_out_of_range_brightness() {
        let spec = AnimationSpec::FadeIn {
            leds: vec![1],
            start_brightness: 0,
            end_brightness: 5000,
            duration_ms: 100,
            easing: Easing::Linear,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_zero_step_numbers() {
        let spec = AnimationSpec::FadeOut {
            leds: vec![1, 0],
            start_brightness: 100,
            duration_ms: 100,
            easing: Easing::Linear,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_empty_or_out_of_range_pattern() {
        let empty = AnimationSpec::Shifting {
            leds: vec![1],
            pattern: vec![],
            step_ms: 100,
            bounce: false,
        };
        assert!(empty.validate().is_err());

        let hot = AnimationSpec::Shifting {
            leds: vec![1],
            pattern: vec![9999],
            step_ms: 100,
            bounce: false,
        };
        assert!(hot.validate().is_err());
    }

    #[test]
    fn sequence_validation_names_the_offending_item() {
        let spec = AnimationSpec::Sequence {
            items: vec![
                TimelineItemSpec {
                    offset_ms: 0,
                    animation: AnimationSpec::Immediate {
                        leds: vec![1],
                        brightness: 100,
                        duration_ms: 0,
                    },
                },
                TimelineItemSpec {
                    offset_ms: 100,
                    animation: AnimationSpec::Immediate {
                        leds: vec![],
                        brightness: 100,
                        duration_ms: 0,
                    },
                },
            ],
        };
        let ConfigError::Invalid { field, .. } = spec.validate().unwrap_err();
        assert_eq!(field, "items[1].leds");
    }

    #[test]
    fn sequence_duration_is_max_inner_end() {
        let spec = AnimationSpec::Sequence {
            items: vec![
                TimelineItemSpec {
                    offset_ms: 0,
                    animation: AnimationSpec::FadeIn {
                        leds: vec![1],
                        start_brightness: 0,
                        end_brightness: 100,
                        duration_ms: 500,
                        easing: Easing::Linear,
                    },
                },
                TimelineItemSpec {
                    offset_ms: 400,
                    animation: AnimationSpec::FadeOut {
                        leds: vec![2],
                        start_brightness: 100,
                        duration_ms: 300,
                        easing: Easing::Linear,
                    },
                },
            ],
        };
        assert_eq!(spec.duration_ms(), 700);
    }

    #[test]
    fn shifting_duration_doubles_when_bouncing() {
        let one_way = AnimationSpec::Shifting {
            leds: vec![1, 2, 3],
            pattern: vec![100, 200, 300],
            step_ms: 100,
            bounce: false,
        };
        assert_eq!(one_way.duration_ms(), 300);

        let bouncing = AnimationSpec::Shifting {
            leds: vec![1, 2, 3],
            pattern: vec![100, 200, 300],
            step_ms: 100,
            bounce: true,
        };
        assert_eq!(bouncing.duration_ms(), 600);
    }

    #[test]
    fn accepted_specs_round_trip_through_serde() {
        let spec: AnimationSpec = serde_json::from_str(fade_in_json()).unwrap();
        spec.validate().unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        let reparsed: AnimationSpec = serde_json::from_str(&json).unwrap();
        reparsed.validate().unwrap();
        assert_eq!(reparsed, spec);
    }
}
