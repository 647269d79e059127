use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub fn index(&self) -> usize {
        match self {
            Slot::One => 0,
            Slot::Two => 1,
        }
    }
}

/// Touch level flags reported by the OTP application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigState {
    pub configured: [bool; 2],
    pub touch_triggered: [bool; 2],
    pub led_inverted: bool,
}

impl ConfigState {
    pub fn is_configured(&self, slot: Slot) -> bool {
        self.configured[slot.index()]
    }

    pub fn is_touch_triggered(&self, slot: Slot) -> bool {
        self.touch_triggered[slot.index()]
    }

    pub fn is_led_inverted(&self) -> bool {
        self.led_inverted
    }
}
