//! macOS backend built on the `coremidi` crate (a safe wrapper around
//! Apple's CoreMIDI framework).
//!
//! Unlike WinMM and ALSA, CoreMIDI delivers packets on a server-owned
//! callback thread rather than one this crate spawns itself; there is no
//! receive loop here; decoding happens directly inside the callback
//! CoreMIDI invokes per `PacketList`.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use coremidi::{Client, Destination, InputPort, OutputPort, PacketBuffer, Source};

use crate::errors::*;
use crate::message::Message;
use crate::{Ignore, Parser};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiInputPort {
    index: usize,
    name: String,
}

impl MidiInputPort {
    pub fn id(&self) -> String {
        self.index.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiOutputPort {
    index: usize,
    name: String,
}

impl MidiOutputPort {
    pub fn id(&self) -> String {
        self.index.to_string()
    }
}

fn is_ignored(message: &Message, ignore_flags: Ignore) -> bool {
    match message {
        Message::SysEx(_) => ignore_flags.ignores_sysex(),
        Message::Clock | Message::MtcQuarterFrame { .. } => ignore_flags.ignores_time(),
        Message::ActiveSense => ignore_flags.ignores_active_sense(),
        _ => false,
    }
}

struct HandlerData<T> {
    parser: Parser,
    ignore_flags: Ignore,
    callback: Box<dyn FnMut(u64, Message, &mut T) + Send>,
    user_data: T,
    start: Option<Instant>,
}

impl<T> HandlerData<T> {
    fn handle_packets(&mut self, bytes: &[u8]) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let timestamp = start.elapsed().as_micros() as u64;
        let ignore_flags = self.ignore_flags;
        let callback = &mut self.callback;
        let user_data = &mut self.user_data;
        self.parser.feed(bytes, |m| {
            if is_ignored(&m, ignore_flags) {
                return;
            }
            callback(timestamp, m, user_data);
        });
    }
}

pub struct MidiInput {
    client: Client,
    ignore_flags: Ignore,
}

enum InputBacking {
    Port { port: InputPort, source: Source },
    Virtual(coremidi::VirtualDestination),
}

pub struct MidiInputConnection<T> {
    client: Client,
    backing: InputBacking,
    handler: Arc<Mutex<HandlerData<T>>>,
}

impl MidiInput {
    pub fn new(client_name: &str) -> Result<Self, InitError> {
        let client = Client::new(client_name).map_err(|_| InitError)?;
        Ok(MidiInput {
            client,
            ignore_flags: Ignore::None,
        })
    }

    pub fn ignore(&mut self, flags: Ignore) {
        self.ignore_flags = flags;
    }

    pub fn ports(&self) -> Vec<MidiInputPort> {
        (0..Source::count())
            .map(|i| MidiInputPort {
                index: i,
                name: Source::from_index(i)
                    .and_then(|s| s.display_name())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        Source::count()
    }

    pub fn port_name(&self, port: &MidiInputPort) -> Result<String, PortInfoError> {
        Source::from_index(port.index)
            .ok_or(PortInfoError::PortNumberOutOfRange)?
            .display_name()
            .ok_or(PortInfoError::CannotRetrievePortName)
    }

    pub fn connect<F, T: Send + 'static>(
        self,
        port: &MidiInputPort,
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let source = match Source::from_index(port.index) {
            Some(s) => s,
            None => return Err(ConnectError::new(ConnectErrorKind::PortNumberOutOfRange, self)),
        };

        let handler = Arc::new(Mutex::new(HandlerData {
            parser: Parser::new(),
            ignore_flags: self.ignore_flags,
            callback: Box::new(callback),
            user_data: data,
            start: None,
        }));
        let handler_for_cb = handler.clone();

        let input_port = match self.client.input_port(port_name, move |packet_list| {
            if let Ok(mut h) = handler_for_cb.lock() {
                for packet in packet_list.iter() {
                    h.handle_packets(packet.data());
                }
            }
        }) {
            Ok(p) => p,
            Err(_) => return Err(ConnectError::other("could not create CoreMIDI input port", self)),
        };

        if input_port.connect_source(&source).is_err() {
            return Err(ConnectError::other("could not connect to CoreMIDI source", self));
        }

        Ok(MidiInputConnection {
            client: self.client,
            backing: InputBacking::Port { port: input_port, source },
            handler,
        })
    }

    pub fn create_virtual<F, T: Send + 'static>(
        self,
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let handler = Arc::new(Mutex::new(HandlerData {
            parser: Parser::new(),
            ignore_flags: self.ignore_flags,
            callback: Box::new(callback),
            user_data: data,
            start: None,
        }));
        let handler_for_cb = handler.clone();

        let virt = match self.client.virtual_destination(port_name, move |packet_list| {
            if let Ok(mut h) = handler_for_cb.lock() {
                for packet in packet_list.iter() {
                    h.handle_packets(packet.data());
                }
            }
        }) {
            Ok(v) => v,
            Err(_) => return Err(ConnectError::other("could not create virtual CoreMIDI destination", self)),
        };

        Ok(MidiInputConnection {
            client: self.client,
            backing: InputBacking::Virtual(virt),
            handler,
        })
    }
}

impl<T> MidiInputConnection<T> {
    pub fn close(self) -> (MidiInput, T) {
        let ignore_flags = {
            let h = self.handler.lock().unwrap();
            h.ignore_flags
        };
        drop(self.backing); // unregisters the CoreMIDI callback, dropping its Arc clone
        let handler = Arc::try_unwrap(self.handler)
            .unwrap_or_else(|_| panic!("CoreMIDI callback outlived its connection"))
            .into_inner()
            .unwrap();
        (
            MidiInput {
                client: self.client,
                ignore_flags,
            },
            handler.user_data,
        )
    }
}

impl<T> std::fmt::Debug for MidiInputConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiInputConnection").finish()
    }
}

pub struct MidiOutput {
    client: Client,
}

enum OutputBacking {
    Port { port: OutputPort, destination: Destination },
    Virtual(coremidi::VirtualSource),
}

pub struct MidiOutputConnection {
    client: Client,
    backing: OutputBacking,
}

impl MidiOutput {
    pub fn new(client_name: &str) -> Result<Self, InitError> {
        let client = Client::new(client_name).map_err(|_| InitError)?;
        Ok(MidiOutput { client })
    }

    pub fn ports(&self) -> Vec<MidiOutputPort> {
        (0..Destination::count())
            .map(|i| MidiOutputPort {
                index: i,
                name: Destination::from_index(i)
                    .and_then(|d| d.display_name())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        Destination::count()
    }

    pub fn port_name(&self, port: &MidiOutputPort) -> Result<String, PortInfoError> {
        Destination::from_index(port.index)
            .ok_or(PortInfoError::PortNumberOutOfRange)?
            .display_name()
            .ok_or(PortInfoError::CannotRetrievePortName)
    }

    pub fn connect(
        self,
        port: &MidiOutputPort,
        port_name: &str,
    ) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        let destination = match Destination::from_index(port.index) {
            Some(d) => d,
            None => return Err(ConnectError::new(ConnectErrorKind::PortNumberOutOfRange, self)),
        };
        let output_port = match self.client.output_port(port_name) {
            Ok(p) => p,
            Err(_) => return Err(ConnectError::other("could not create CoreMIDI output port", self)),
        };
        Ok(MidiOutputConnection {
            client: self.client,
            backing: OutputBacking::Port { port: output_port, destination },
        })
    }

    pub fn create_virtual(
        self,
        port_name: &str,
    ) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        let virt = match self.client.virtual_source(port_name) {
            Ok(v) => v,
            Err(_) => return Err(ConnectError::other("could not create virtual CoreMIDI source", self)),
        };
        Ok(MidiOutputConnection {
            client: self.client,
            backing: OutputBacking::Virtual(virt),
        })
    }
}

impl MidiOutputConnection {
    pub fn close(self) -> MidiOutput {
        MidiOutput { client: self.client }
    }

    pub fn send(&mut self, message: &[u8]) -> Result<(), SendError> {
        let packets = PacketBuffer::from_data(0, message.to_vec());
        let result = match &self.backing {
            OutputBacking::Virtual(virt) => virt.received(packets.as_ref()),
            OutputBacking::Port { port, destination } => port.send(destination, packets.as_ref()),
        };
        result.map_err(|_| SendError::Other("CoreMIDI send failed"))
    }

    pub fn send_sysex(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        self.send(bytes)
    }
}

impl std::fmt::Debug for MidiOutputConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiOutputConnection").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ignored_filters_sysex_time_and_active_sense_only() {
        assert!(is_ignored(&Message::SysEx(&[]), Ignore::Sysex));
        assert!(!is_ignored(&Message::SysEx(&[]), Ignore::Time));
        assert!(is_ignored(&Message::Clock, Ignore::Time));
        assert!(is_ignored(&Message::MtcQuarterFrame { piece: 0, data: 0 }, Ignore::Time));
        assert!(is_ignored(&Message::ActiveSense, Ignore::ActiveSense));
        assert!(!is_ignored(&Message::Reset, Ignore::All));
    }

    #[test]
    fn port_id_is_stable_for_same_index() {
        let a = MidiInputPort { index: 2, name: "Foo".into() };
        let b = MidiInputPort { index: 2, name: "Foo".into() };
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), "2");
    }
}
