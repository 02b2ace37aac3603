//! Windows backend built on the Windows Multimedia (WinMM) MIDI API via
//! the `windows` crate's generated bindings.
//!
//! WinMM delivers input messages on an internal multimedia thread through
//! a callback registered at `midiInOpen` time. Short channel/system
//! messages arrive packed into a 32-bit value; SysEx arrives through a
//! small ring of pre-allocated buffers that must be unprepared and
//! requeued by hand after each use. There is no virtual-endpoint concept
//! on this backend.

use std::ptr;
use std::thread::sleep;
use std::time::Duration;

use parking_lot::Mutex;
use windows::Win32::Media::Multimedia::{
    midiInAddBuffer, midiInClose, midiInGetDevCapsW, midiInGetNumDevs, midiInOpen,
    midiInPrepareHeader, midiInReset, midiInStart, midiInStop, midiInUnprepareHeader,
    midiOutClose, midiOutGetDevCapsW, midiOutGetNumDevs, midiOutLongMsg, midiOutOpen,
    midiOutPrepareHeader, midiOutReset, midiOutShortMsg, midiOutUnprepareHeader, CALLBACK_FUNCTION,
    CALLBACK_NULL, HMIDIIN, HMIDIOUT, MIDIERR_NOTREADY, MIDIERR_STILLPLAYING, MIDIHDR,
    MIDIINCAPSW, MIDIOUTCAPSW, MIM_DATA, MIM_LONGDATA, MIM_LONGERROR, MMSYSERR_BADDEVICEID,
    MMSYSERR_NOERROR,
};

use crate::errors::*;
use crate::message::Message;
use crate::{Ignore, Parser};

const RT_SYSEX_BUFFER_SIZE: usize = 1024;
const RT_SYSEX_BUFFER_COUNT: usize = 4;

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Number of bytes (including the status byte) packed into `dwParam1` for a
/// short message with the given status byte.
fn short_message_len(status: u8) -> usize {
    match status {
        0x80..=0xBF | 0xE0..=0xEF | 0xF2 => 3,
        0xC0..=0xDF | 0xF1 | 0xF3 => 2,
        _ => 1,
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

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiInputPort {
    index: u32,
    name: String,
}

impl MidiInputPort {
    pub fn id(&self) -> String {
        self.index.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiOutputPort {
    index: u32,
    name: String,
}

impl MidiOutputPort {
    pub fn id(&self) -> String {
        self.index.to_string()
    }
}

#[derive(Debug)]
pub struct MidiInput {
    ignore_flags: Ignore,
}

/// Heap-allocated state shared between the owning thread and the WinMM
/// callback thread; reached through the raw `dwInstance` pointer handed to
/// `midiInOpen`, so its address must stay fixed for the connection's
/// lifetime (guaranteed by boxing it once and never moving the box's
/// contents).
struct HandlerData<T> {
    parser: Parser,
    ignore_flags: Ignore,
    callback: Box<dyn FnMut(u64, Message, &mut T) + Send>,
    user_data: T,
    in_handle: HMIDIIN,
    sysex_buffer: [*mut MIDIHDR; RT_SYSEX_BUFFER_COUNT],
}

// Safety: the only aliased access to `HandlerData` is through the `Mutex`
// wrapping it; WinMM invokes the callback on its own multimedia thread.
unsafe impl<T: Send> Send for HandlerData<T> {}

pub struct MidiInputConnection<T> {
    handler_data: Box<Mutex<HandlerData<T>>>,
}

unsafe impl<T: Send> Send for MidiInputConnection<T> {}

impl MidiInput {
    pub fn new(_client_name: &str) -> Result<Self, InitError> {
        Ok(MidiInput { ignore_flags: Ignore::None })
    }

    pub fn ignore(&mut self, flags: Ignore) {
        self.ignore_flags = flags;
    }

    pub fn ports(&self) -> Vec<MidiInputPort> {
        (0..self.port_count() as u32)
            .map(|index| MidiInputPort {
                index,
                name: self.port_name_raw(index).unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        unsafe { midiInGetNumDevs() as usize }
    }

    fn port_name_raw(&self, index: u32) -> Result<String, PortInfoError> {
        let mut caps = MIDIINCAPSW::default();
        let result = unsafe {
            midiInGetDevCapsW(index as usize, &mut caps, std::mem::size_of::<MIDIINCAPSW>() as u32)
        };
        if result == MMSYSERR_BADDEVICEID {
            return Err(PortInfoError::PortNumberOutOfRange);
        } else if result != MMSYSERR_NOERROR {
            return Err(PortInfoError::CannotRetrievePortName);
        }
        Ok(from_wide(&caps.szPname))
    }

    pub fn port_name(&self, port: &MidiInputPort) -> Result<String, PortInfoError> {
        self.port_name_raw(port.index)
    }

    pub fn connect<F, T: Send + 'static>(
        self,
        port: &MidiInputPort,
        _port_name: &str,
        callback: F,
        data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        let handler_data = Box::new(Mutex::new(HandlerData {
            parser: Parser::new(),
            ignore_flags: self.ignore_flags,
            callback: Box::new(callback),
            user_data: data,
            in_handle: HMIDIIN::default(),
            sysex_buffer: [ptr::null_mut(); RT_SYSEX_BUFFER_COUNT],
        }));

        let instance_ptr = &*handler_data as *const Mutex<HandlerData<T>>;
        let mut in_handle = HMIDIIN::default();
        let result = unsafe {
            midiInOpen(
                &mut in_handle,
                port.index,
                handle_input::<T> as usize,
                instance_ptr as usize,
                CALLBACK_FUNCTION,
            )
        };
        if result == MMSYSERR_BADDEVICEID {
            return Err(ConnectError::new(ConnectErrorKind::PortNumberOutOfRange, self));
        } else if result != MMSYSERR_NOERROR {
            return Err(ConnectError::other("could not open WinMM MIDI input port", self));
        }

        {
            let mut guard = handler_data.lock();
            guard.in_handle = in_handle;

            for i in 0..RT_SYSEX_BUFFER_COUNT {
                let mut buffer = vec![0u8; RT_SYSEX_BUFFER_SIZE].into_boxed_slice();
                let data_ptr = buffer.as_mut_ptr();
                std::mem::forget(buffer);

                let header = Box::into_raw(Box::new(MIDIHDR {
                    lpData: windows::core::PSTR(data_ptr),
                    dwBufferLength: RT_SYSEX_BUFFER_SIZE as u32,
                    dwBytesRecorded: 0,
                    dwUser: i,
                    dwFlags: 0,
                    lpNext: ptr::null_mut(),
                    reserved: 0,
                    dwOffset: 0,
                    dwReserved: [0; 4],
                }));
                guard.sysex_buffer[i] = header;

                let result =
                    unsafe { midiInPrepareHeader(in_handle, header, std::mem::size_of::<MIDIHDR>() as u32) };
                if result != MMSYSERR_NOERROR {
                    return Err(ConnectError::other(
                        "could not prepare WinMM MIDI input sysex buffer",
                        self,
                    ));
                }
                let result =
                    unsafe { midiInAddBuffer(in_handle, header, std::mem::size_of::<MIDIHDR>() as u32) };
                if result != MMSYSERR_NOERROR {
                    return Err(ConnectError::other(
                        "could not queue WinMM MIDI input sysex buffer",
                        self,
                    ));
                }
            }
        }

        let result = unsafe { midiInStart(in_handle) };
        if result != MMSYSERR_NOERROR {
            unsafe { midiInClose(in_handle) };
            return Err(ConnectError::other("could not start WinMM MIDI input port", self));
        }

        Ok(MidiInputConnection { handler_data })
    }

    /// WinMM has no virtual-endpoint concept; always fails with `NoBackend`.
    pub fn create_virtual<F, T: Send + 'static>(
        self,
        _port_name: &str,
        _callback: F,
        _data: T,
    ) -> Result<MidiInputConnection<T>, ConnectError<MidiInput>>
    where
        F: FnMut(u64, Message, &mut T) + Send + 'static,
    {
        Err(ConnectError::new(ConnectErrorKind::NoBackend, self))
    }
}

extern "system" fn handle_input<T: Send + 'static>(
    _hmidiin: HMIDIIN,
    wmsg: u32,
    dwinstance: usize,
    dwparam1: usize,
    dwparam2: u32,
) {
    if wmsg != MIM_DATA && wmsg != MIM_LONGDATA && wmsg != MIM_LONGERROR {
        return;
    }

    // Safety: `dwinstance` is the pointer handed to `midiInOpen` in
    // `connect`, valid for as long as the port stays open.
    let handler_data = unsafe { &*(dwinstance as *const Mutex<HandlerData<T>>) };
    let mut data = handler_data.lock();
    let timestamp = dwparam2 as u64 * 1_000;

    if wmsg == MIM_DATA {
        let packed = dwparam1 as u32;
        let status = (packed & 0xFF) as u8;
        if status & 0x80 == 0 {
            return;
        }
        let nbytes = short_message_len(status);
        let bytes = packed.to_le_bytes();
        let raw = bytes[..nbytes].to_vec();

        let ignore_flags = data.ignore_flags;
        let HandlerData { parser, callback, user_data, .. } = &mut *data;
        parser.feed(&raw, |m| {
            if is_ignored(&m, ignore_flags) {
                return;
            }
            callback(timestamp, m, user_data);
        });
        return;
    }

    // MIM_LONGDATA / MIM_LONGERROR: a requeued sysex buffer came back.
    let header = unsafe { &*(dwparam1 as *const MIDIHDR) };
    let index = header.dwUser;
    if header.dwBytesRecorded == 0 {
        // WinMM hands back an emptied buffer while the port is closing;
        // requeuing here would resurrect it after `midiInReset`.
        return;
    }

    if wmsg == MIM_LONGDATA {
        let ignore_flags = data.ignore_flags;
        if !ignore_flags.ignores_sysex() {
            let raw = unsafe {
                std::slice::from_raw_parts(header.lpData.0, header.dwBytesRecorded as usize)
            }
            .to_vec();
            let HandlerData { parser, callback, user_data, .. } = &mut *data;
            parser.feed(&raw, |m| callback(timestamp, m, user_data));
        }
    }

    let in_handle = data.in_handle;
    let buffer = data.sysex_buffer[index];
    let result = unsafe { midiInAddBuffer(in_handle, buffer, std::mem::size_of::<MIDIHDR>() as u32) };
    if result != MMSYSERR_NOERROR {
        warn!("failed to requeue WinMM MIDI input sysex buffer");
    }
}

impl<T> MidiInputConnection<T> {
    pub fn close(self) -> (MidiInput, T) {
        let (in_handle, sysex_buffer) = {
            let guard = self.handler_data.lock();
            (guard.in_handle, guard.sysex_buffer)
        };

        unsafe {
            midiInReset(in_handle);
            midiInStop(in_handle);

            for header in sysex_buffer {
                if header.is_null() {
                    continue;
                }
                let result =
                    midiInUnprepareHeader(in_handle, header, std::mem::size_of::<MIDIHDR>() as u32);
                if result != MMSYSERR_NOERROR {
                    warn!("ignoring error while unpreparing WinMM MIDI input sysex buffer");
                }
                let owned = Box::from_raw(header);
                drop(Vec::from_raw_parts(owned.lpData.0, 0, RT_SYSEX_BUFFER_SIZE));
            }

            midiInClose(in_handle);
        }

        // Moving out of a `Box` is allowed once we own it outright, which
        // `close(self)` guarantees: nothing else can be holding the
        // callback's raw pointer once `midiInClose` above has returned.
        let handler_data = (*self.handler_data).into_inner();
        (MidiInput { ignore_flags: handler_data.ignore_flags }, handler_data.user_data)
    }
}

impl<T> std::fmt::Debug for MidiInputConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiInputConnection").finish()
    }
}

#[derive(Debug)]
pub struct MidiOutput;

pub struct MidiOutputConnection {
    out_handle: HMIDIOUT,
}

impl MidiOutput {
    pub fn new(_client_name: &str) -> Result<Self, InitError> {
        Ok(MidiOutput)
    }

    pub fn ports(&self) -> Vec<MidiOutputPort> {
        (0..self.port_count() as u32)
            .map(|index| MidiOutputPort {
                index,
                name: self.port_name_raw(index).unwrap_or_default(),
            })
            .collect()
    }

    pub fn port_count(&self) -> usize {
        unsafe { midiOutGetNumDevs() as usize }
    }

    fn port_name_raw(&self, index: u32) -> Result<String, PortInfoError> {
        let mut caps = MIDIOUTCAPSW::default();
        let result = unsafe {
            midiOutGetDevCapsW(index as usize, &mut caps, std::mem::size_of::<MIDIOUTCAPSW>() as u32)
        };
        if result == MMSYSERR_BADDEVICEID {
            return Err(PortInfoError::PortNumberOutOfRange);
        } else if result != MMSYSERR_NOERROR {
            return Err(PortInfoError::CannotRetrievePortName);
        }
        Ok(from_wide(&caps.szPname))
    }

    pub fn port_name(&self, port: &MidiOutputPort) -> Result<String, PortInfoError> {
        self.port_name_raw(port.index)
    }

    pub fn connect(
        self,
        port: &MidiOutputPort,
        _port_name: &str,
    ) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        let mut out_handle = HMIDIOUT::default();
        let result =
            unsafe { midiOutOpen(&mut out_handle, port.index, 0, 0, CALLBACK_NULL) };
        if result == MMSYSERR_BADDEVICEID {
            return Err(ConnectError::new(ConnectErrorKind::PortNumberOutOfRange, self));
        } else if result != MMSYSERR_NOERROR {
            return Err(ConnectError::other("could not open WinMM MIDI output port", self));
        }
        Ok(MidiOutputConnection { out_handle })
    }

    /// WinMM has no virtual-endpoint concept; always fails with `NoBackend`.
    pub fn create_virtual(self, _port_name: &str) -> Result<MidiOutputConnection, ConnectError<MidiOutput>> {
        Err(ConnectError::new(ConnectErrorKind::NoBackend, self))
    }
}

impl MidiOutputConnection {
    pub fn close(self) -> MidiOutput {
        // The actual teardown happens in `Drop`.
        MidiOutput
    }

    pub fn send(&mut self, message: &[u8]) -> Result<(), SendError> {
        let nbytes = message.len();
        if nbytes == 0 {
            return Err(SendError::InvalidData("message to be sent must not be empty"));
        }

        if message[0] == 0xF0 {
            let mut buffer = message.to_vec();
            let mut sysex = MIDIHDR {
                lpData: windows::core::PSTR(buffer.as_mut_ptr()),
                dwBufferLength: nbytes as u32,
                dwBytesRecorded: 0,
                dwUser: 0,
                dwFlags: 0,
                lpNext: ptr::null_mut(),
                reserved: 0,
                dwOffset: 0,
                dwReserved: [0; 4],
            };

            let result = unsafe {
                midiOutPrepareHeader(self.out_handle, &mut sysex, std::mem::size_of::<MIDIHDR>() as u32)
            };
            if result != MMSYSERR_NOERROR {
                return Err(SendError::Other("preparing sysex header failed"));
            }

            loop {
                let result = unsafe {
                    midiOutLongMsg(self.out_handle, &mut sysex, std::mem::size_of::<MIDIHDR>() as u32)
                };
                if result == MIDIERR_NOTREADY {
                    sleep(Duration::from_millis(1));
                    continue;
                } else if result != MMSYSERR_NOERROR {
                    return Err(SendError::Other("sending sysex message failed"));
                }
                break;
            }

            loop {
                let result = unsafe {
                    midiOutUnprepareHeader(self.out_handle, &mut sysex, std::mem::size_of::<MIDIHDR>() as u32)
                };
                if result == MIDIERR_STILLPLAYING {
                    sleep(Duration::from_millis(1));
                    continue;
                }
                break;
            }
        } else {
            if nbytes > 3 {
                return Err(SendError::InvalidData("non-sysex message must not be longer than 3 bytes"));
            }
            let mut packed = [0u8; 4];
            packed[..nbytes].copy_from_slice(message);
            let packet = u32::from_le_bytes(packed);

            loop {
                let result = unsafe { midiOutShortMsg(self.out_handle, packet) };
                if result == MIDIERR_NOTREADY {
                    sleep(Duration::from_millis(1));
                    continue;
                } else if result != MMSYSERR_NOERROR {
                    return Err(SendError::Other("sending non-sysex message failed"));
                }
                break;
            }
        }

        Ok(())
    }

    pub fn send_sysex(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        self.send(bytes)
    }
}

impl Drop for MidiOutputConnection {
    fn drop(&mut self) {
        unsafe {
            midiOutReset(self.out_handle);
            midiOutClose(self.out_handle);
        }
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
    fn from_wide_stops_at_nul_terminator() {
        let buf: Vec<u16> = "USB MIDI Device".encode_utf16().chain(std::iter::once(0)).chain([0x41, 0x42]).collect();
        assert_eq!(from_wide(&buf), "USB MIDI Device");
    }

    #[test]
    fn from_wide_handles_missing_terminator() {
        let buf: Vec<u16> = "no nul".encode_utf16().collect();
        assert_eq!(from_wide(&buf), "no nul");
    }

    #[test]
    fn short_message_len_matches_channel_and_system_common_status_bytes() {
        assert_eq!(short_message_len(0x90), 3); // note on
        assert_eq!(short_message_len(0x80), 3); // note off
        assert_eq!(short_message_len(0xB0), 3); // control change
        assert_eq!(short_message_len(0xE0), 3); // pitch bend
        assert_eq!(short_message_len(0xC0), 2); // program change
        assert_eq!(short_message_len(0xD0), 2); // channel pressure
        assert_eq!(short_message_len(0xF1), 2); // mtc quarter frame
        assert_eq!(short_message_len(0xF2), 3); // song position
        assert_eq!(short_message_len(0xF3), 2); // song select
        assert_eq!(short_message_len(0xF6), 1); // tune request
    }

    #[test]
    fn is_ignored_filters_sysex_time_and_active_sense_only() {
        assert!(is_ignored(&Message::SysEx(&[]), Ignore::Sysex));
        assert!(!is_ignored(&Message::SysEx(&[]), Ignore::Time));
        assert!(is_ignored(&Message::Clock, Ignore::Time));
        assert!(is_ignored(&Message::MtcQuarterFrame { piece: 0, data: 0 }, Ignore::Time));
        assert!(is_ignored(&Message::ActiveSense, Ignore::ActiveSense));
        assert!(!is_ignored(&Message::Start, Ignore::All));
        assert!(!is_ignored(&Message::Clock, Ignore::Sysex));
    }
}
