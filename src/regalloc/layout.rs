use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A virtual register ID. The numeric range alone decides where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterId(pub u16);

impl RegisterId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// IDs above 255 need the 16-bit operand encoding.
    pub fn is_extended(self) -> bool {
        self.0 > u8::MAX as u16
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Global,
    Frame,
    Temp,
    Module,
}

impl Bank {
    /// Priority order used when a request falls through.
    pub const ALL: [Bank; 4] = [Bank::Global, Bank::Frame, Bank::Temp, Bank::Module];

    pub fn name(self) -> &'static str {
        match self {
            Bank::Global => "GLOBAL",
            Bank::Frame => "FRAME",
            Bank::Temp => "TEMP",
            Bank::Module => "MODULE",
        }
    }
}

/// Where a register ID is stored at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Global(usize),
    Frame(usize),
    Temp(usize),
    Module(usize),
    Spill(RegisterId),
}

impl Location {
    pub fn bank(self) -> Option<Bank> {
        match self {
            Location::Global(_) => Some(Bank::Global),
            Location::Frame(_) => Some(Bank::Frame),
            Location::Temp(_) => Some(Bank::Temp),
            Location::Module(_) => Some(Bank::Module),
            Location::Spill(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self.bank() {
            Some(bank) => bank.name(),
            None => "SPILL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("register bank {0} must have at least one slot")]
    EmptyBank(&'static str),

    #[error("register banks ({0} slots) leave no room for spill IDs")]
    NoSpillRange(u32),
}

/// Bank capacities. Banks are laid out back to back in priority order,
/// followed by the open-ended spill range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterLayout {
    globals: u16,
    frame: u16,
    temps: u16,
    module: u16,
}

impl Default for RegisterLayout {
    fn default() -> Self {
        RegisterLayout {
            globals: 64,
            frame: 128,
            temps: 48,
            module: 16,
        }
    }
}

impl RegisterLayout {
    pub fn new(globals: u16, frame: u16, temps: u16, module: u16) -> Result<Self, LayoutError> {
        let layout = RegisterLayout {
            globals,
            frame,
            temps,
            module,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check a layout that did not come through `new`, e.g. a deserialized one.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for bank in Bank::ALL {
            if self.capacity(bank) == 0 {
                return Err(LayoutError::EmptyBank(bank.name()));
            }
        }
        let total = Bank::ALL
            .iter()
            .map(|b| self.capacity(*b) as u32)
            .sum::<u32>();
        if total >= u16::MAX as u32 {
            return Err(LayoutError::NoSpillRange(total));
        }
        Ok(())
    }

    pub fn capacity(&self, bank: Bank) -> usize {
        match bank {
            Bank::Global => self.globals as usize,
            Bank::Frame => self.frame as usize,
            Bank::Temp => self.temps as usize,
            Bank::Module => self.module as usize,
        }
    }

    pub fn start(&self, bank: Bank) -> u16 {
        match bank {
            Bank::Global => 0,
            Bank::Frame => self.globals,
            Bank::Temp => self.globals + self.frame,
            Bank::Module => self.globals + self.frame + self.temps,
        }
    }

    /// First spill ID; every ID at or above it is spilled.
    pub fn spill_start(&self) -> u16 {
        self.globals + self.frame + self.temps + self.module
    }

    pub fn id(&self, bank: Bank, slot: usize) -> RegisterId {
        RegisterId(self.start(bank) + slot as u16)
    }

    /// Decode an ID into its storage location. Total over the ID space.
    pub fn locate(&self, id: RegisterId) -> Location {
        let r = id.0;
        let frame = self.start(Bank::Frame);
        let temp = self.start(Bank::Temp);
        let module = self.start(Bank::Module);
        let spill = self.spill_start();

        if r < frame {
            Location::Global(r as usize)
        } else if r < temp {
            Location::Frame((r - frame) as usize)
        } else if r < module {
            Location::Temp((r - temp) as usize)
        } else if r < spill {
            Location::Module((r - module) as usize)
        } else {
            Location::Spill(id)
        }
    }

    /// Short bank-qualified name, e.g. `G3`, `F0`, `S300`.
    pub fn describe(&self, id: RegisterId) -> String {
        match self.locate(id) {
            Location::Global(slot) => format!("G{}", slot),
            Location::Frame(slot) => format!("F{}", slot),
            Location::Temp(slot) => format!("T{}", slot),
            Location::Module(slot) => format!("M{}", slot),
            Location::Spill(id) => format!("S{}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_layout_ranges() {
        let layout = RegisterLayout::default();
        assert_eq!(layout.start(Bank::Global), 0);
        assert_eq!(layout.start(Bank::Frame), 64);
        assert_eq!(layout.start(Bank::Temp), 192);
        assert_eq!(layout.start(Bank::Module), 240);
        assert_eq!(layout.spill_start(), 256);
    }

    #[test]
    fn test_locate_boundaries() {
        let layout = RegisterLayout::default();
        assert_eq!(layout.locate(RegisterId(0)), Location::Global(0));
        assert_eq!(layout.locate(RegisterId(63)), Location::Global(63));
        assert_eq!(layout.locate(RegisterId(64)), Location::Frame(0));
        assert_eq!(layout.locate(RegisterId(191)), Location::Frame(127));
        assert_eq!(layout.locate(RegisterId(192)), Location::Temp(0));
        assert_eq!(layout.locate(RegisterId(239)), Location::Temp(47));
        assert_eq!(layout.locate(RegisterId(240)), Location::Module(0));
        assert_eq!(layout.locate(RegisterId(255)), Location::Module(15));
        assert_eq!(
            layout.locate(RegisterId(256)),
            Location::Spill(RegisterId(256))
        );
    }

    #[test]
    fn test_empty_bank_rejected() {
        assert_eq!(
            RegisterLayout::new(0, 8, 8, 8),
            Err(LayoutError::EmptyBank("GLOBAL"))
        );
    }

    #[test]
    fn test_full_id_space_rejected() {
        assert!(RegisterLayout::new(u16::MAX / 2, u16::MAX / 2, 1, 1).is_err());
    }

    #[test]
    fn test_describe_register() {
        let layout = RegisterLayout::default();
        assert_eq!(layout.describe(RegisterId(3)), "G3");
        assert_eq!(layout.describe(RegisterId(65)), "F1");
        assert_eq!(layout.describe(RegisterId(300)), "S300");
    }

    proptest! {
        /// Every ID decodes to one location, and the location maps back to the ID.
        #[test]
        fn locate_is_total_and_invertible(raw in any::<u16>()) {
            let layout = RegisterLayout::default();
            let id = RegisterId(raw);
            match layout.locate(id) {
                Location::Spill(s) => {
                    prop_assert_eq!(s, id);
                    prop_assert!(raw >= layout.spill_start());
                }
                loc => {
                    let bank = loc.bank().unwrap();
                    let slot = match loc {
                        Location::Global(s) | Location::Frame(s)
                        | Location::Temp(s) | Location::Module(s) => s,
                        Location::Spill(_) => unreachable!(),
                    };
                    prop_assert!(slot < layout.capacity(bank));
                    prop_assert_eq!(layout.id(bank, slot), id);
                }
            }
        }
    }
}
