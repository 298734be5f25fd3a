//! Controller channel buffers exchanged with the host's peripheral interface.
//!
//! Each poll, the host hands the engine one [`PollChannel`] per slot holding the
//! pending joybus command and the channel's receive buffers. The engine
//! overwrites the receive side with relay-authoritative data.

/// Joybus command byte at the head of a channel's transmit buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JoybusCommand {
    /// Identify the device and its accessory state.
    Status,
    /// Read the button word.
    ControllerRead,
    /// Read 32 bytes from the accessory.
    PakRead,
    /// Write 32 bytes to the accessory.
    PakWrite,
    /// Reset the device, answered like [`Status`](Self::Status).
    Reset,
    /// Any other command. Passed through untouched.
    Other(u8),
}

impl JoybusCommand {
    /// Parses a command byte.
    #[must_use]
    pub const fn from_byte(value: u8) -> Self {
        match value {
            0x00 => Self::Status,
            0x01 => Self::ControllerRead,
            0x02 => Self::PakRead,
            0x03 => Self::PakWrite,
            0xFF => Self::Reset,
            other => Self::Other(other),
        }
    }

    /// Returns the command byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Status => 0x00,
            Self::ControllerRead => 0x01,
            Self::PakRead => 0x02,
            Self::PakWrite => 0x03,
            Self::Reset => 0xFF,
            Self::Other(other) => other,
        }
    }
}

impl From<u8> for JoybusCommand {
    #[inline]
    fn from(value: u8) -> Self {
        Self::from_byte(value)
    }
}

/// Receive-buffer size of a controller channel.
pub const RX_BUF_LEN: usize = 33;

/// Status bits the device sets when nothing answers on the channel.
pub const NO_DEVICE_BITS: u8 = 0xC0;

/// Controller type reported for raw-data slots: absolute counters plus accessory port.
pub const RAW_CONTROLLER_TYPE: u16 = 0x0001 | 0x0004;

/// One controller channel for one poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PollChannel {
    /// The pending command, or `None` if the host is not transmitting on this channel.
    pub command: Option<JoybusCommand>,
    /// The channel's receive status byte.
    pub rx_status: u8,
    /// The channel's receive buffer.
    pub rx_buf: [u8; RX_BUF_LEN],
}

impl Default for PollChannel {
    fn default() -> Self {
        Self {
            command: None,
            rx_status: 0,
            rx_buf: [0; RX_BUF_LEN],
        }
    }
}

impl PollChannel {
    /// A channel carrying `command` with empty receive buffers.
    #[must_use]
    pub fn with_command(command: JoybusCommand) -> Self {
        Self {
            command: Some(command),
            ..Self::default()
        }
    }

    /// A controller-read channel pre-filled with the local controller's button word.
    #[must_use]
    pub fn controller_read(buttons: u32) -> Self {
        let mut channel = Self::with_command(JoybusCommand::ControllerRead);
        channel.set_buttons(buttons);
        channel
    }

    /// The button word in the first four receive bytes (host byte order is little-endian).
    #[must_use]
    pub fn buttons(&self) -> u32 {
        u32::from_le_bytes([self.rx_buf[0], self.rx_buf[1], self.rx_buf[2], self.rx_buf[3]])
    }

    /// Writes a button word into the first four receive bytes.
    pub fn set_buttons(&mut self, buttons: u32) {
        self.rx_buf[..4].copy_from_slice(&buttons.to_le_bytes());
    }

    /// Answers a non-read command for a slot whose frontend forwards raw joybus traffic.
    ///
    /// The relay only carries button words, so status, reset and accessory traffic
    /// get a canned reply that keeps every peer's core in the same state.
    pub(crate) fn answer_raw_command(&mut self) {
        match self.command {
            Some(JoybusCommand::Status | JoybusCommand::Reset) => {
                let [lo, hi] = RAW_CONTROLLER_TYPE.to_le_bytes();
                self.rx_buf[0] = lo;
                self.rx_buf[1] = hi;
                self.rx_buf[2] = 0;
            },
            Some(JoybusCommand::PakRead) => self.rx_buf[32] = 0xFF,
            Some(JoybusCommand::PakWrite) => self.rx_buf[0] = 0xFF,
            _ => {},
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        for byte in 0..=u8::MAX {
            assert_eq!(JoybusCommand::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(JoybusCommand::from(0x01), JoybusCommand::ControllerRead);
        assert_eq!(JoybusCommand::from(0xFF), JoybusCommand::Reset);
        assert_eq!(JoybusCommand::from(0x13), JoybusCommand::Other(0x13));
    }

    #[test]
    fn test_buttons_are_little_endian() {
        let channel = PollChannel::controller_read(0x0000_0080);
        assert_eq!(&channel.rx_buf[..4], &[0x80, 0, 0, 0]);
        assert_eq!(channel.buttons(), 0x80);
    }

    #[test]
    fn test_raw_status_reply() {
        let mut channel = PollChannel::with_command(JoybusCommand::Status);
        channel.rx_buf[..3].copy_from_slice(&[9, 9, 9]);
        channel.answer_raw_command();
        assert_eq!(&channel.rx_buf[..3], &[0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_raw_pak_replies() {
        let mut read = PollChannel::with_command(JoybusCommand::PakRead);
        read.answer_raw_command();
        assert_eq!(read.rx_buf[32], 0xFF);

        let mut write = PollChannel::with_command(JoybusCommand::PakWrite);
        write.answer_raw_command();
        assert_eq!(write.rx_buf[0], 0xFF);
    }

    #[test]
    fn test_other_commands_untouched() {
        let mut channel = PollChannel::with_command(JoybusCommand::Other(0x13));
        channel.answer_raw_command();
        assert_eq!(channel, PollChannel::with_command(JoybusCommand::Other(0x13)));
    }
}
