//! Extension traits for creating virtual endpoints.
//!
//! Implemented on every backend: CoreMIDI and the ALSA sequencer expose
//! first-class virtual ports that other applications can connect to
//! directly; WinMM has no such concept, so its implementations always
//! return `Err(ConnectErrorKind::NoBackend)`.

use crate::errors::ConnectError;
use crate::message::Message;
use crate::{MidiInputConnection, MidiOutputConnection};

/// Extends `MidiInput` with the ability to create a virtual input port
/// that other applications can connect to directly, bypassing the usual
/// `ports()`/`connect()` enumeration dance.
pub trait VirtualInput<T: Send>
where
    Self: Sized,
{
    fn create_virtual<F>(
        self,
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<Self>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static;
}

/// Extends `MidiOutput` with the ability to create a virtual output port.
pub trait VirtualOutput
where
    Self: Sized,
{
    fn create_virtual(self, port_name: &str) -> Result<MidiOutputConnection, ConnectError<Self>>;
}
