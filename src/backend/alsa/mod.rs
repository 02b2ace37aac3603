//! Linux backend built on the ALSA sequencer, via the safe `alsa` crate.
//!
//! Endpoints are ordinary sequencer ports. A receive thread owns the
//! `Seq` handle for the connection's lifetime and is woken either by an
//! incoming event or by a byte written to a pipe at teardown time
//! (`poll()` over both fds at once, so there is no polling interval to
//! tune). Each backend event is decoded back into raw MIDI bytes and fed
//! through a [`crate::Parser`] so SysEx reassembly and real-time
//! interleaving are handled identically to the other two backends, even
//! though ALSA itself already delivers one event per message.

use std::ffi::CString;
use std::mem;
use std::thread::{Builder, JoinHandle};

use alsa::seq::{
    Addr, ClientIter, EventType, MidiEvent, PortCap, PortInfo, PortIter, PortSubscribe, PortType,
    QueueTempo,
};
use alsa::{Direction, Seq};

use crate::errors::*;
use crate::message::Message;
use crate::{Ignore, Parser};

const INITIAL_CODER_BUFFER_SIZE: usize = 32;
/// Arbitrary tempo (µs/quarter-note) and resolution used for the input
/// queue's timestamp clock; only the ratio to wall-clock time matters
/// since we read back real, not tick, time.
const QUEUE_TEMPO_US: u32 = 600_000;
const QUEUE_PPQ: i32 = 240;

fn input_cap_ok(cap: PortCap) -> bool {
    let full = PortCap::READ | PortCap::SUBS_READ;
    (cap & full) == full || cap.contains(PortCap::READ)
}

fn output_cap_ok(cap: PortCap) -> bool {
    let full = PortCap::WRITE | PortCap::SUBS_WRITE;
    (cap & full) == full
}

fn is_midi_port(port_type: PortType) -> bool {
    port_type.intersects(PortType::MIDI_GENERIC | PortType::SYNTH)
}

fn matching_ports(seq: &Seq, is_match: impl Fn(PortCap) -> bool) -> Vec<PortInfo> {
    ClientIter::new(seq)
        .flat_map(|c| PortIter::new(seq, c.get_client()).collect::<Vec<_>>())
        .filter(|p| is_midi_port(p.get_type()))
        .filter(|p| is_match(p.get_capability()))
        .collect()
}

fn port_name_of(seq: &Seq, pinfo: &PortInfo) -> Result<String, PortInfoError> {
    let cinfo = seq
        .get_any_client_info(pinfo.get_client())
        .map_err(|_| PortInfoError::CannotRetrievePortName)?;
    let client_name = cinfo
        .get_name()
        .map_err(|_| PortInfoError::CannotRetrievePortName)?;
    Ok(format!("{} {}:{}", client_name, pinfo.get_client(), pinfo.get_port()))
}

struct EventDecoder {
    ev: MidiEvent,
}

impl EventDecoder {
    fn new() -> EventDecoder {
        let coder = MidiEvent::new(0).unwrap();
        coder.enable_running_status(false);
        EventDecoder { ev: coder }
    }
}

struct EventEncoder {
    ev: MidiEvent,
    buffer_size: usize,
}

impl EventEncoder {
    fn new(buffer_size: usize) -> EventEncoder {
        EventEncoder {
            ev: MidiEvent::new(buffer_size as u32).unwrap(),
            buffer_size,
        }
    }

    fn ensure_capacity(&mut self, needed: usize) -> Result<(), ()> {
        if needed > self.buffer_size {
            self.ev.resize_buffer(needed as u32).map_err(|_| ())?;
            self.buffer_size = needed;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiInputPort {
    addr: (i32, i32),
    name: String,
}

impl MidiInputPort {
    pub fn id(&self) -> String {
        format!("{}:{}", self.addr.0, self.addr.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiOutputPort {
    addr: (i32, i32),
    name: String,
}

impl MidiOutputPort {
    pub fn id(&self) -> String {
        format!("{}:{}", self.addr.0, self.addr.1)
    }
}

pub struct MidiInput {
    ignore_flags: Ignore,
    seq: Option<Seq>,
}

pub struct MidiInputConnection<T> {
    subscription: Option<PortSubscribe>,
    thread: Option<JoinHandle<(HandlerData<T>, T)>>,
    vport: i32,
    trigger_send_fd: i32,
}

struct HandlerData<T> {
    ignore_flags: Ignore,
    seq: Seq,
    trigger_rcv_fd: i32,
    callback: Box<dyn FnMut(u64, Message, &mut T) + Send>,
    queue_id: i32,
    parser: Parser,
}

impl MidiInput {
    pub fn new(client_name: &str) -> Result<Self, InitError> {
        let seq = Seq::open(None, Some(Direction::Capture), true).map_err(|_| InitError)?;
        let c_client_name = CString::new(client_name).map_err(|_| InitError)?;
        seq.set_client_name(&c_client_name).map_err(|_| InitError)?;
        Ok(MidiInput {
            ignore_flags: Ignore::None,
            seq: Some(seq),
        })
    }

    pub fn ignore(&mut self, flags: Ignore) {
        self.ignore_flags = flags;
    }

    pub fn ports(&self) -> Vec<MidiInputPort> {
        let seq = self.seq.as_ref().unwrap();
        matching_ports(seq, input_cap_ok)
            .into_iter()
            .map(|p| MidiInputPort {
                addr: (p.get_client(), p.get_port()),
                name: port_name_of(seq, &p).unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        matching_ports(self.seq.as_ref().unwrap(), input_cap_ok).len()
    }

    pub fn port_name(&self, port: &MidiInputPort) -> Result<String, PortInfoError> {
        if port.name.is_empty() {
            Err(PortInfoError::InvalidPort)
        } else {
            Ok(port.name.clone())
        }
    }

    fn init_trigger(&self) -> Result<[i32; 2], ()> {
        let mut fds = [-1i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            Err(())
        } else {
            Ok(fds)
        }
    }

    fn init_queue(&mut self) -> i32 {
        let seq = self.seq.as_mut().unwrap();
        let name = CString::new("midio queue").unwrap();
        let queue_id = seq.alloc_named_queue(&name).unwrap();
        let qtempo = QueueTempo::empty().unwrap();
        qtempo.set_tempo(QUEUE_TEMPO_US);
        qtempo.set_ppq(QUEUE_PPQ);
        let _ = seq.set_queue_tempo(queue_id, &qtempo);
        let _ = seq.drain_output();
        queue_id
    }

    fn create_port(&mut self, port_name: &CString, queue_id: i32) -> Result<i32, ()> {
        let pinfo = PortInfo::empty().unwrap();
        pinfo.set_capability(PortCap::WRITE | PortCap::SUBS_WRITE);
        pinfo.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
        pinfo.set_midi_channels(16);
        pinfo.set_timestamping(true);
        pinfo.set_timestamp_real(true);
        pinfo.set_timestamp_queue(queue_id);
        pinfo.set_name(port_name);
        self.seq
            .as_mut()
            .unwrap()
            .create_port(&pinfo)
            .map(|_| pinfo.get_port())
            .map_err(|_| ())
    }

    fn start_input_queue(&mut self, queue_id: i32) {
        let seq = self.seq.as_mut().unwrap();
        let _ = seq.control_queue(queue_id, EventType::Start, 0, None);
        let _ = seq.drain_output();
    }

    fn spawn<F, T: Send + 'static>(
        mut self,
        subscription: Option<PortSubscribe>,
        vport: i32,
        queue_id: i32,
        trigger_fds: [i32; 2],
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let handler_data = HandlerData {
            ignore_flags: self.ignore_flags,
            seq: self.seq.take().unwrap(),
            trigger_rcv_fd: trigger_fds[0],
            callback: Box::new(callback),
            queue_id,
            parser: Parser::new(),
        };

        let name = format!("midio ALSA input handler ({})", port_name);
        let mut data = data;
        let thread = match Builder::new().name(name).spawn(move || {
            let h = handle_input(handler_data, &mut data);
            (h, data)
        }) {
            Ok(handle) => handle,
            Err(_) => {
                return Err(ConnectError::other(
                    "could not start ALSA input handler thread",
                    MidiInput {
                        ignore_flags: self.ignore_flags,
                        seq: None,
                    },
                ));
            }
        };

        Ok(MidiInputConnection {
            subscription,
            thread: Some(thread),
            vport,
            trigger_send_fd: trigger_fds[1],
        })
    }

    pub fn connect<F, T: Send + 'static>(
        mut self,
        port: &MidiInputPort,
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let trigger_fds = match self.init_trigger() {
            Ok(fds) => fds,
            Err(()) => {
                return Err(ConnectError::other(
                    "could not create communication pipe for ALSA handler",
                    self,
                ))
            }
        };

        let queue_id = self.init_queue();

        let src = Addr {
            client: port.addr.0,
            port: port.addr.1,
        };

        let c_port_name = match CString::new(port_name) {
            Ok(s) => s,
            Err(_) => return Err(ConnectError::other("port_name must not contain null bytes", self)),
        };

        let vport = match self.create_port(&c_port_name, queue_id) {
            Ok(vp) => vp,
            Err(()) => return Err(ConnectError::other("could not create ALSA input port", self)),
        };

        let sub = PortSubscribe::empty().unwrap();
        sub.set_sender(src);
        sub.set_dest(Addr {
            client: self.seq.as_ref().unwrap().client_id().unwrap(),
            port: vport,
        });
        if self.seq.as_ref().unwrap().subscribe_port(&sub).is_err() {
            return Err(ConnectError::other("could not create ALSA input subscription", self));
        }

        self.start_input_queue(queue_id);
        self.spawn(Some(sub), vport, queue_id, trigger_fds, port_name, callback, data)
    }

    pub fn create_virtual<F, T: Send + 'static>(
        mut self,
        port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let trigger_fds = match self.init_trigger() {
            Ok(fds) => fds,
            Err(()) => {
                return Err(ConnectError::other(
                    "could not create communication pipe for ALSA handler",
                    self,
                ))
            }
        };

        let queue_id = self.init_queue();

        let c_port_name = match CString::new(port_name) {
            Ok(s) => s,
            Err(_) => return Err(ConnectError::other("port_name must not contain null bytes", self)),
        };

        let vport = match self.create_port(&c_port_name, queue_id) {
            Ok(vp) => vp,
            Err(()) => return Err(ConnectError::other("could not create ALSA input port", self)),
        };

        self.start_input_queue(queue_id);
        self.spawn(None, vport, queue_id, trigger_fds, port_name, callback, data)
    }
}

impl<T> MidiInputConnection<T> {
    pub fn close(mut self) -> (MidiInput, T) {
        let (handler_data, data) = self.close_internal();
        (
            MidiInput {
                ignore_flags: handler_data.ignore_flags,
                seq: Some(handler_data.seq),
            },
            data,
        )
    }

    /// Must only be called once; guarded by `thread.is_some()`.
    fn close_internal(&mut self) -> (HandlerData<T>, T) {
        let _ = unsafe {
            libc::write(
                self.trigger_send_fd,
                &false as *const bool as *const _,
                mem::size_of::<bool>(),
            )
        };

        let thread = self.thread.take().unwrap();
        let (handler_data, data) = thread.join().unwrap();

        if let Some(ref subscription) = self.subscription {
            let _ = handler_data
                .seq
                .unsubscribe_port(subscription.get_sender(), subscription.get_dest());
        }

        unsafe {
            libc::close(handler_data.trigger_rcv_fd);
            libc::close(self.trigger_send_fd);
        }

        let _ = handler_data.seq.control_queue(handler_data.queue_id, EventType::Stop, 0, None);
        let _ = handler_data.seq.drain_output();
        let _ = handler_data.seq.free_queue(handler_data.queue_id);
        let _ = handler_data.seq.delete_port(self.vport);

        (handler_data, data)
    }
}

impl<T> Drop for MidiInputConnection<T> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close_internal();
        }
    }
}

impl<T> std::fmt::Debug for MidiInputConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiInputConnection").field("vport", &self.vport).finish()
    }
}

pub struct MidiOutput {
    seq: Option<Seq>,
}

pub struct MidiOutputConnection {
    seq: Option<Seq>,
    vport: i32,
    coder: EventEncoder,
    subscription: Option<PortSubscribe>,
}

impl MidiOutput {
    pub fn new(client_name: &str) -> Result<Self, InitError> {
        let seq = Seq::open(None, Some(Direction::Playback), true).map_err(|_| InitError)?;
        let c_client_name = CString::new(client_name).map_err(|_| InitError)?;
        seq.set_client_name(&c_client_name).map_err(|_| InitError)?;
        Ok(MidiOutput { seq: Some(seq) })
    }

    pub fn ports(&self) -> Vec<MidiOutputPort> {
        let seq = self.seq.as_ref().unwrap();
        matching_ports(seq, output_cap_ok)
            .into_iter()
            .map(|p| MidiOutputPort {
                addr: (p.get_client(), p.get_port()),
                name: port_name_of(seq, &p).unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        matching_ports(self.seq.as_ref().unwrap(), output_cap_ok).len()
    }

    pub fn port_name(&self, port: &MidiOutputPort) -> Result<String, PortInfoError> {
        if port.name.is_empty() {
            Err(PortInfoError::InvalidPort)
        } else {
            Ok(port.name.clone())
        }
    }

    pub fn connect(
        mut self,
        port: &MidiOutputPort,
        port_name: &str,
    ) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        let c_port_name = match CString::new(port_name) {
            Ok(s) => s,
            Err(_) => return Err(ConnectError::other("port_name must not contain null bytes", self)),
        };

        let vport = match self.seq.as_ref().unwrap().create_simple_port(
            &c_port_name,
            PortCap::READ | PortCap::SUBS_READ,
            PortType::MIDI_GENERIC | PortType::APPLICATION,
        ) {
            Ok(vp) => vp,
            Err(_) => return Err(ConnectError::other("could not create ALSA output port", self)),
        };

        let sub = PortSubscribe::empty().unwrap();
        sub.set_sender(Addr {
            client: self.seq.as_ref().unwrap().client_id().unwrap(),
            port: vport,
        });
        sub.set_dest(Addr {
            client: port.addr.0,
            port: port.addr.1,
        });
        sub.set_time_update(true);
        sub.set_time_real(true);
        if self.seq.as_ref().unwrap().subscribe_port(&sub).is_err() {
            return Err(ConnectError::other("could not create ALSA output subscription", self));
        }

        Ok(MidiOutputConnection {
            seq: self.seq.take(),
            vport,
            coder: EventEncoder::new(INITIAL_CODER_BUFFER_SIZE),
            subscription: Some(sub),
        })
    }

    pub fn create_virtual(
        mut self,
        port_name: &str,
    ) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        let c_port_name = match CString::new(port_name) {
            Ok(s) => s,
            Err(_) => return Err(ConnectError::other("port_name must not contain null bytes", self)),
        };

        let vport = match self.seq.as_ref().unwrap().create_simple_port(
            &c_port_name,
            PortCap::READ | PortCap::SUBS_READ,
            PortType::MIDI_GENERIC | PortType::APPLICATION,
        ) {
            Ok(vp) => vp,
            Err(_) => return Err(ConnectError::other("could not create ALSA output port", self)),
        };

        Ok(MidiOutputConnection {
            seq: self.seq.take(),
            vport,
            coder: EventEncoder::new(INITIAL_CODER_BUFFER_SIZE),
            subscription: None,
        })
    }
}

impl MidiOutputConnection {
    pub fn close(mut self) -> MidiOutput {
        self.close_internal();
        MidiOutput { seq: self.seq.take() }
    }

    pub fn send(&mut self, message: &[u8]) -> Result<(), SendError> {
        let nbytes = message.len();
        if self.coder.ensure_capacity(nbytes).is_err() {
            return Err(SendError::Other("could not resize ALSA encoding buffer"));
        }

        let mut ev = match self.coder.ev.encode(message) {
            Ok((_, Some(ev))) => ev,
            _ => return Err(SendError::InvalidData("ALSA encoder reported invalid data")),
        };

        ev.set_source(self.vport);
        ev.set_subs();
        ev.set_direct();

        if self.seq.as_ref().unwrap().event_output(&mut ev).is_err() {
            return Err(SendError::Other("could not send encoded ALSA message"));
        }
        let _ = self.seq.as_mut().unwrap().drain_output();
        Ok(())
    }

    pub fn send_sysex(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        self.send(bytes)
    }

    fn close_internal(&mut self) {
        if let Some(seq) = self.seq.as_ref() {
            if let Some(ref subscription) = self.subscription {
                let _ = seq.unsubscribe_port(subscription.get_sender(), subscription.get_dest());
            }
            let _ = seq.delete_port(self.vport);
        }
    }
}

impl Drop for MidiOutputConnection {
    fn drop(&mut self) {
        if self.seq.is_some() {
            self.close_internal();
        }
    }
}

impl std::fmt::Debug for MidiOutputConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiOutputConnection").field("vport", &self.vport).finish()
    }
}

/// Poll/decode loop run on the dedicated input thread. Returns the
/// `HandlerData` so its `Seq` can be reclaimed by `close()`.
fn handle_input<T>(mut data: HandlerData<T>, user_data: &mut T) -> HandlerData<T> {
    use alsa::PollDescriptors;

    let mut decoder = EventDecoder::new();
    let mut buffer = [0u8; 12];

    let mut poll_fds: Vec<libc::pollfd> = {
        let poll_desc_info = (&data.seq, Some(Direction::Capture));
        let count = poll_desc_info.count() + 1;
        let mut v = Vec::with_capacity(count);
        unsafe { v.set_len(count) };
        poll_desc_info.fill(&mut v[1..]).unwrap();
        v
    };
    poll_fds[0].fd = data.trigger_rcv_fd;
    poll_fds[0].events = libc::POLLIN;

    let mut do_input = true;
    let mut seq_input = data.seq.input();

    while do_input {
        if let Ok(0) = seq_input.event_input_pending(true) {
            if unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1) } >= 0
                && poll_fds[0].revents & libc::POLLIN != 0
            {
                let mut stop = 0u8;
                let _ = unsafe { libc::read(poll_fds[0].fd, &mut stop as *mut u8 as *mut _, 1) };
                do_input = false;
            }
            continue;
        }

        let mut ev = match seq_input.event_input() {
            Ok(ev) => ev,
            Err(_) => continue,
        };

        let ignore_flags = data.ignore_flags;
        let mut raw: Vec<u8> = Vec::new();

        match ev.get_type() {
            EventType::PortSubscribed | EventType::PortUnsubscribed => continue,
            EventType::Qframe | EventType::Tick | EventType::Clock if ignore_flags.ignores_time() => continue,
            EventType::Sensing if ignore_flags.ignores_active_sense() => continue,
            EventType::Sysex => {
                if ignore_flags.ignores_sysex() {
                    continue;
                }
                if let Some(ext) = ev.get_ext() {
                    raw.extend_from_slice(ext);
                }
            }
            _ => {
                if let Ok(nbytes) = decoder.ev.decode(&mut buffer, &mut ev) {
                    if nbytes > 0 {
                        raw.extend_from_slice(&buffer[..nbytes]);
                    }
                }
            }
        }

        if raw.is_empty() {
            continue;
        }

        let alsa_time = match ev.get_time() {
            Some(t) => t,
            None => continue,
        };
        let timestamp = alsa_time.as_secs() * 1_000_000 + alsa_time.subsec_nanos() as u64 / 1_000;

        let callback = &mut data.callback;
        data.parser.feed(&raw, |m| callback(timestamp, m, user_data));
    }

    drop(seq_input);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_cap_requires_read_or_full_subs_read() {
        assert!(input_cap_ok(PortCap::READ));
        assert!(input_cap_ok(PortCap::READ | PortCap::SUBS_READ));
        assert!(!input_cap_ok(PortCap::SUBS_READ));
        assert!(!input_cap_ok(PortCap::WRITE));
    }

    #[test]
    fn output_cap_requires_full_write_and_subs_write() {
        assert!(output_cap_ok(PortCap::WRITE | PortCap::SUBS_WRITE));
        assert!(!output_cap_ok(PortCap::WRITE));
        assert!(!output_cap_ok(PortCap::SUBS_WRITE));
        assert!(!output_cap_ok(PortCap::READ | PortCap::SUBS_READ));
    }

    #[test]
    fn midi_port_type_matches_generic_and_synth_only() {
        assert!(is_midi_port(PortType::MIDI_GENERIC));
        assert!(is_midi_port(PortType::SYNTH));
        assert!(is_midi_port(PortType::MIDI_GENERIC | PortType::SYNTH));
        assert!(!is_midi_port(PortType::APPLICATION));
    }
}
