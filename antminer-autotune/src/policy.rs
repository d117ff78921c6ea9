//! Hysteresis throttle policy.
//!
//! Rules are evaluated in priority order and the first match wins:
//!
//! 1. **Clamp.** A device reporting more than `max_freq` is brought back to
//!    `max_freq` at once, regardless of temperature or timing.
//! 2. **Cool-down.** Above `max_temp` for longer than `dec_time`, step back to
//!    the previous frequency in the history.
//! 3. **Speed-up.** Below `min_temp` for longer than `inc_time`, step up. The
//!    step count grows with the distance below `min_temp`, one extra notch per
//!    3 °C, so a very cold device converges faster.
//!
//! The policy is pure. Applying the decision and updating the history is the
//! caller's job, and only after the device accepted the change.

use crate::device::{DeviceModel, DeviceState, Telemetry};

/// Degrees below `min_temp` per additional speed-up notch.
const DEGREES_PER_STEP: f64 = 3.0;

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Clamp,
    CoolDown,
    SpeedUp { steps: u32 },
}

/// A frequency change the policy wants applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub adjustment: Adjustment,
    pub frequency: u32,
}

/// Decide whether the device's frequency should change.
pub fn decide(model: &DeviceModel, state: &DeviceState, telemetry: &Telemetry) -> Option<Decision> {
    let api_frequency = telemetry.api_frequency;

    if api_frequency > model.max_freq {
        return Some(Decision {
            adjustment: Adjustment::Clamp,
            frequency: model.max_freq,
        });
    }

    if api_frequency > model.min_freq
        && telemetry.temperature > model.max_temp
        && telemetry.elapsed > model.dec_time
    {
        return Some(Decision {
            adjustment: Adjustment::CoolDown,
            frequency: state.previous_frequency(model),
        });
    }

    if api_frequency < model.max_freq
        && telemetry.temperature < model.min_temp
        && telemetry.elapsed > model.inc_time
    {
        let steps = speed_up_steps(model, telemetry.temperature);
        return Some(Decision {
            adjustment: Adjustment::SpeedUp { steps },
            frequency: state.next_frequency(model, steps),
        });
    }

    None
}

/// Number of notches to speed up by at the given temperature.
pub fn speed_up_steps(model: &DeviceModel, temperature: f64) -> u32 {
    ((temperature - model.min_temp).abs() / DEGREES_PER_STEP).floor() as u32 + 1
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::testing::{model, telemetry};
    use crate::job::JobGroup;

    fn state(history: Vec<u32>) -> DeviceState {
        DeviceState::with_history("10.0.0.21", JobGroup::new(), history)
    }

    #[test]
    fn test_clamp_ignores_temperature_and_time() {
        let model = model();
        let state = state(vec![650]);

        for temperature in [40.0, 74.0, 95.0] {
            for elapsed in [0, 5, 10_000] {
                let decision = decide(&model, &state, &telemetry(temperature, 700, elapsed));
                assert_eq!(
                    decision,
                    Some(Decision {
                        adjustment: Adjustment::Clamp,
                        frequency: 650
                    })
                );
            }
        }
    }

    #[test]
    fn test_cool_down_never_fires_at_floor() {
        let model = model();
        let state = state(vec![500]);

        assert_eq!(decide(&model, &state, &telemetry(99.0, 500, 10_000)), None);
    }

    #[test]
    fn test_speed_up_never_fires_at_ceiling() {
        let model = model();
        let state = state(vec![650]);

        assert_eq!(decide(&model, &state, &telemetry(30.0, 650, 100_000)), None);
    }

    #[test]
    fn test_cool_down_waits_for_dec_time() {
        let model = model();
        let state = state(vec![550, 600]);

        // Exactly at dec_time is not enough
        assert_eq!(decide(&model, &state, &telemetry(78.0, 600, 30)), None);
        assert!(decide(&model, &state, &telemetry(78.0, 600, 31)).is_some());
    }

    #[test]
    fn test_cool_down_returns_prior_history_entry() {
        let model = model();
        let state = state(vec![525, 550, 600]);

        let decision = decide(&model, &state, &telemetry(80.0, 600, 120)).unwrap();
        assert_eq!(decision.adjustment, Adjustment::CoolDown);
        assert_eq!(decision.frequency, 550);
    }

    #[test]
    fn test_speed_up_waits_for_inc_time() {
        let model = model();
        let state = state(vec![550]);

        assert_eq!(decide(&model, &state, &telemetry(70.0, 550, 900)), None);
        assert!(decide(&model, &state, &telemetry(70.0, 550, 901)).is_some());
    }

    #[test]
    fn test_speed_up_step_examples() {
        let model = model();
        assert_eq!(speed_up_steps(&model, 69.0), 2);
        assert_eq!(speed_up_steps(&model, 60.0), 5);
        assert_eq!(speed_up_steps(&model, 71.5), 1);
    }

    #[test]
    fn test_speed_up_step_is_monotonic() {
        let model = model();
        let mut previous = 0;
        for tenths in (0..=400).rev() {
            let temperature = 32.0 + tenths as f64 / 10.0;
            if temperature >= model.min_temp {
                continue;
            }
            let steps = speed_up_steps(&model, temperature);
            assert!(steps >= previous, "step shrank at {temperature}");
            previous = steps;
        }
    }

    #[test]
    fn test_speed_up_moves_by_steps() {
        let model = model();
        let state = state(vec![525]);

        let decision = decide(&model, &state, &telemetry(69.0, 525, 1000)).unwrap();
        assert_eq!(decision.adjustment, Adjustment::SpeedUp { steps: 2 });
        assert_eq!(decision.frequency, 575);
    }

    #[test]
    fn test_comfortable_band_holds() {
        let model = model();
        let state = state(vec![600]);

        assert_eq!(decide(&model, &state, &telemetry(74.0, 600, 100_000)), None);
    }

    #[test]
    fn test_hot_device_scenario() {
        let model = DeviceModel {
            dec_time: Duration::from_secs(30),
            ..model()
        };
        let state = state(vec![550, 600]);

        let decision = decide(&model, &state, &telemetry(78.0, 600, 40));
        assert_eq!(
            decision,
            Some(Decision {
                adjustment: Adjustment::CoolDown,
                frequency: 550
            })
        );
    }
}
