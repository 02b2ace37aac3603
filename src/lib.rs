//! A cross-platform, realtime MIDI 1.0 input and output library.
//!
//! `midio` provides a single API over the three native MIDI backends:
//! CoreMIDI on macOS, the ALSA sequencer on Linux, and WinMM on Windows.
//! It covers endpoint enumeration, opening existing devices for reading
//! or writing, creating virtual endpoints where the backend supports
//! them (macOS, Linux), and a byte-stream parser/serializer ([`message`])
//! that reassembles SysEx spanning multiple packets and real-time bytes
//! interleaved mid-stream.
//!
//! Start with [`MidiInput`] or [`MidiOutput`]:
//!
//! ```no_run
//! use midio::{MidiInput, MidiIO, Ignore};
//!
//! let mut midi_in = MidiInput::new("midio probe").unwrap();
//! midi_in.ignore(Ignore::None);
//! for port in midi_in.ports() {
//!     println!("{}", midi_in.port_name(&port).unwrap());
//! }
//! ```

#[macro_use]
extern crate log;

mod backend;
mod common;
mod errors;
pub mod message;
mod parser;
pub mod os;

pub use common::*;
pub use errors::*;
pub use message::Message;
pub(crate) use parser::Parser;

/// Flags to filter out unwanted incoming MIDI messages before they reach
/// an input callback. Combine with bitwise-or; the bit layout matches
/// the one historically used by RtMidi-derived libraries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignore {
    None = 0x00,
    Sysex = 0x01,
    Time = 0x02,
    SysexAndTime = 0x03,
    ActiveSense = 0x04,
    SysexAndActiveSense = 0x05,
    TimeAndActiveSense = 0x06,
    All = 0x07,
}

impl std::ops::BitOr for Ignore {
    type Output = Ignore;
    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self::Output {
        // Safe: every combination of the three bits also exists as a variant.
        unsafe { std::mem::transmute(self as u8 | rhs as u8) }
    }
}

impl Ignore {
    #[inline(always)]
    pub fn contains(self, other: Ignore) -> bool {
        self as u8 & other as u8 != 0
    }

    pub(crate) fn ignores_sysex(self) -> bool {
        self.contains(Ignore::Sysex)
    }

    pub(crate) fn ignores_time(self) -> bool {
        self.contains(Ignore::Time)
    }

    pub(crate) fn ignores_active_sense(self) -> bool {
        self.contains(Ignore::ActiveSense)
    }
}

impl Default for Ignore {
    fn default() -> Self {
        Ignore::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_bitor_combines_flags() {
        let combined = Ignore::Sysex | Ignore::Time;
        assert_eq!(combined, Ignore::SysexAndTime);
        assert!(combined.contains(Ignore::Sysex));
        assert!(combined.contains(Ignore::Time));
        assert!(!combined.contains(Ignore::ActiveSense));
    }

    #[test]
    fn ignore_default_is_none() {
        assert_eq!(Ignore::default(), Ignore::None);
    }
}
