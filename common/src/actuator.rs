use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Off,
    On,
}

impl ValveState {
    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Logic levels for the status LED (active low) and the relay (active high).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLevels {
    pub led_high: bool,
    pub relay_high: bool,
}

impl OutputLevels {
    pub fn for_state(state: ValveState) -> Self {
        match state {
            ValveState::On => Self {
                led_high: false,
                relay_high: true,
            },
            ValveState::Off => Self {
                led_high: true,
                relay_high: false,
            },
        }
    }
}

pub trait Actuator {
    fn on(&mut self);
    fn off(&mut self);

    fn apply(&mut self, state: ValveState) {
        match state {
            ValveState::On => self.on(),
            ValveState::Off => self.off(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_polarity_is_inverted() {
        let on = OutputLevels::for_state(ValveState::On);
        assert!(!on.led_high);
        assert!(on.relay_high);

        let off = OutputLevels::for_state(ValveState::Off);
        assert!(off.led_high);
        assert!(!off.relay_high);
    }

    #[test]
    fn apply_dispatches_to_on_and_off() {
        #[derive(Default)]
        struct Pins(Vec<OutputLevels>);

        impl Actuator for Pins {
            fn on(&mut self) {
                self.0.push(OutputLevels::for_state(ValveState::On));
            }

            fn off(&mut self) {
                self.0.push(OutputLevels::for_state(ValveState::Off));
            }
        }

        let mut pins = Pins::default();
        pins.apply(ValveState::On);
        pins.apply(ValveState::Off);

        assert_eq!(
            pins.0,
            vec![
                OutputLevels::for_state(ValveState::On),
                OutputLevels::for_state(ValveState::Off)
            ]
        );
    }
}
