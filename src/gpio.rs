//! Board-control GPIO lines.
//!
//! Recovery drives the device's boot-strap and enable pins through the
//! character-device GPIO interface. The chip is opened lazily on first use
//! and kept for the lifetime of the process; per-pin handles are held in a
//! direction-tracking map so that switching a pin between output and
//! high-impedance releases and re-requests the line.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Board-control pins we are allowed to touch (BCM numbering). Everything
/// else on the header is reserved for other lab wiring.
pub const ALLOWED_PINS: [u8; 16] = [5, 6, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27];

/// A requested pin level. `HighZ` releases the line as an input with the
/// internal pull-up, which is what "unpressed" boot buttons look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinValue {
    #[serde(rename = "0")]
    Low,
    #[serde(rename = "1")]
    High,
    #[serde(rename = "z")]
    HighZ,
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "0",
            Self::High => "1",
            Self::HighZ => "z",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum GpioError {
    #[error("pin {0} is not in the allowed board-control set")]
    NotAllowed(u8),
    #[error("gpio chip: {0}")]
    Chip(String),
}

/// Seam between the recovery engine and the GPIO hardware.
pub trait GpioControl: Send + Sync + fmt::Debug {
    fn set_pin(&self, pin: u8, value: PinValue) -> Result<(), GpioError>;
}

fn check_allowed(pin: u8) -> Result<(), GpioError> {
    if ALLOWED_PINS.contains(&pin) {
        Ok(())
    } else {
        Err(GpioError::NotAllowed(pin))
    }
}

/// Records pin writes without touching hardware. Used on hosts without a
/// GPIO chip and by the test suites.
#[derive(Debug, Default)]
pub struct NoopGpio {
    states: Mutex<HashMap<u8, PinValue>>,
    writes: Mutex<Vec<(u8, PinValue)>>,
}

impl NoopGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written per pin.
    pub fn states(&self) -> HashMap<u8, PinValue> {
        self.states.lock().unwrap().clone()
    }

    /// Every write in order, for asserting pulse sequences.
    pub fn writes(&self) -> Vec<(u8, PinValue)> {
        self.writes.lock().unwrap().clone()
    }
}

impl GpioControl for NoopGpio {
    fn set_pin(&self, pin: u8, value: PinValue) -> Result<(), GpioError> {
        check_allowed(pin)?;
        debug!("gpio (noop): pin {pin} <- {value}");
        self.states.lock().unwrap().insert(pin, value);
        self.writes.lock().unwrap().push((pin, value));
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use chip::RppalGpio;

#[cfg(target_os = "linux")]
mod chip {
    use super::{check_allowed, GpioControl, GpioError, PinValue};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tracing::debug;

    enum Held {
        Output(rppal::gpio::OutputPin),
        InputPullup(#[allow(dead_code)] rppal::gpio::InputPin),
    }

    /// `/dev/gpiochip0` through rppal. The chip handle lives for the whole
    /// process; pin handles are re-requested whenever the direction changes.
    pub struct RppalGpio {
        chip: rppal::gpio::Gpio,
        pins: Mutex<HashMap<u8, Held>>,
    }

    impl std::fmt::Debug for RppalGpio {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RppalGpio")
                .field("pins", &self.pins.lock().unwrap().keys().collect::<Vec<_>>())
                .finish()
        }
    }

    impl RppalGpio {
        /// Probe for the chip. Fails on hosts without a GPIO character
        /// device, in which case callers fall back to [`super::NoopGpio`].
        pub fn open() -> Result<Self, GpioError> {
            let chip = rppal::gpio::Gpio::new().map_err(|e| GpioError::Chip(e.to_string()))?;
            Ok(Self {
                chip,
                pins: Mutex::new(HashMap::new()),
            })
        }
    }

    impl GpioControl for RppalGpio {
        fn set_pin(&self, pin: u8, value: PinValue) -> Result<(), GpioError> {
            check_allowed(pin)?;
            let mut pins = self.pins.lock().unwrap();
            debug!("gpio: pin {pin} <- {value}");

            match value {
                PinValue::Low | PinValue::High => {
                    // Reuse an existing output handle; otherwise release
                    // whatever direction the pin had and re-request it.
                    if !matches!(pins.get(&pin), Some(Held::Output(_))) {
                        pins.remove(&pin);
                        let output = self
                            .chip
                            .get(pin)
                            .map_err(|e| GpioError::Chip(e.to_string()))?
                            .into_output();
                        pins.insert(pin, Held::Output(output));
                    }
                    if let Some(Held::Output(output)) = pins.get_mut(&pin) {
                        output.set_reset_on_drop(false);
                        if value == PinValue::Low {
                            output.set_low();
                        } else {
                            output.set_high();
                        }
                    }
                }
                PinValue::HighZ => {
                    pins.remove(&pin);
                    let input = self
                        .chip
                        .get(pin)
                        .map_err(|e| GpioError::Chip(e.to_string()))?
                        .into_input_pullup();
                    pins.insert(pin, Held::InputPullup(input));
                }
            }
            Ok(())
        }
    }
}
