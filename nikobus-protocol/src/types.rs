//! Wire constants and function codes.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Every line on the bus ends with a carriage return.
pub const FRAME_TERMINATOR: char = '\r';

/// Frame start marker.
pub const FRAME_START: char = '$';

/// `length` field minus the data hex length: `$`, two length digits,
/// four CRC16 digits, two CRC8 digits and the terminator.
pub const FRAME_OVERHEAD: usize = 10;

/// PC-Link reset frame, `make_command(0x11, "0000", None)`.
pub const RESET_FRAME: &str = "$10110000B8CF9D";

/// Control strings sent after the connection is opened.
pub const HANDSHAKE: [&str; 8] = [
    "++++",
    "ATH0",
    "ATZ",
    RESET_FRAME,
    "#L0",
    "#E0",
    "#L0",
    "#E1",
];

/// Prefix of a button press notification.
pub const BUTTON_PRESS_PREFIX: &str = "#N";

/// Echoes of the handshake and bus keep-alives with no meaning to us.
pub const IGNORED_PREFIXES: [&str; 7] = ["#E0", "#E1", "#L0", "++++", "ATH0", "ATZ", "$0E"];

/// Acknowledgement that a set command was processed.
pub const COMMAND_PROCESSED_PREFIXES: [&str; 2] = ["$0515", "$0516"];

/// Refresh requests sent by a feedback module.
pub const FEEDBACK_REFRESH_PREFIXES: [&str; 2] = ["$1012", "$1017"];

/// Answer of an output module to a state read.
pub const FEEDBACK_ANSWER_PREFIX: &str = "$1C";

/// Ack of a state read issued by us.
pub const MANUAL_REFRESH_PREFIXES: [&str; 2] = ["$0512", "$0517"];

/// Module register inventory answer.
pub const MODULE_INVENTORY_PREFIX: &str = "$2E";

/// Controller address inventory answer.
pub const ADDRESS_INVENTORY_PREFIX: &str = "$18";

/// Ack prefix; followed by the function code.
pub const ACK_PREFIX: &str = "$05";

/// Hex digits of state in an answer (6 channel bytes).
pub const STATE_HEX_LEN: usize = 12;

/// Channels per output group.
pub const CHANNELS_PER_GROUP: u8 = 6;

/// Marker byte appended to a full group write.
pub const GROUP_WRITE_MARKER: &str = "FF";

/// Bus function codes used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Switch / roller register inventory.
    ModuleInventory = 0x10,
    /// PC-Link reset.
    Reset = 0x11,
    /// Read state of channels 1-6.
    GetGroup1 = 0x12,
    /// Controller address inventory.
    AddressInventory = 0x14,
    /// Write state of channels 1-6.
    SetGroup1 = 0x15,
    /// Write state of channels 7-12.
    SetGroup2 = 0x16,
    /// Read state of channels 7-12.
    GetGroup2 = 0x17,
    /// Dimmer register inventory.
    DimmerInventory = 0x22,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Upper-case 2-digit hex form.
    pub fn hex(self) -> String {
        format!("{:02X}", self as u8)
    }

    /// Ack signal the bus sends after accepting this function.
    pub fn ack_signal(self) -> String {
        format!("{}{}", ACK_PREFIX, self.hex())
    }

    /// Answer signal for a command addressed to `swapped_address`.
    pub fn answer_signal(self, swapped_address: &str) -> String {
        match self {
            FunctionCode::AddressInventory => {
                format!("{}{}", ADDRESS_INVENTORY_PREFIX, swapped_address)
            }
            _ => format!("{}{}", FEEDBACK_ANSWER_PREFIX, swapped_address),
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(FunctionCode::ModuleInventory),
            0x11 => Ok(FunctionCode::Reset),
            0x12 => Ok(FunctionCode::GetGroup1),
            0x14 => Ok(FunctionCode::AddressInventory),
            0x15 => Ok(FunctionCode::SetGroup1),
            0x16 => Ok(FunctionCode::SetGroup2),
            0x17 => Ok(FunctionCode::GetGroup2),
            0x22 => Ok(FunctionCode::DimmerInventory),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unknown function code {:02X}",
                other
            ))),
        }
    }
}

/// Output group of a module: channels 1-6 or 7-12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Group {
    One,
    Two,
}

impl Group {
    /// Group holding a 1-based channel.
    pub fn of_channel(channel: u8) -> Option<Self> {
        match channel {
            1..=6 => Some(Group::One),
            7..=12 => Some(Group::Two),
            _ => None,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Group::One),
            2 => Some(Group::Two),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Group::One => 1,
            Group::Two => 2,
        }
    }

    pub fn get_function(self) -> FunctionCode {
        match self {
            Group::One => FunctionCode::GetGroup1,
            Group::Two => FunctionCode::GetGroup2,
        }
    }

    pub fn set_function(self) -> FunctionCode {
        match self {
            Group::One => FunctionCode::SetGroup1,
            Group::Two => FunctionCode::SetGroup2,
        }
    }

    /// Zero-based index of `channel` within this group's 6 state bytes.
    pub fn slot(self, channel: u8) -> Option<usize> {
        if Group::of_channel(channel)? != self {
            return None;
        }
        Some(((channel - 1) % CHANNELS_PER_GROUP) as usize)
    }
}
