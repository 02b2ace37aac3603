use std::error::Error;
use std::fmt;

const INVALID_PORT_MSG: &'static str = "invalid port";
const PORT_OUT_OF_RANGE_MSG: &'static str = "provided port number was out of range";
const CANNOT_RETRIEVE_PORT_NAME_MSG: &'static str = "unknown error when trying to retrieve the port name";
const NO_BACKEND_MSG: &'static str = "this feature is not supported by the current backend";
const ALREADY_OPEN_MSG: &'static str = "device is already open";
const NOT_OPEN_MSG: &'static str = "device is not open";
const ALLOC_FAILED_MSG: &'static str = "a resource allocation failed";
const INVALID_ARG_MSG: &'static str = "an argument violated a documented constraint";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// An error that can occur during initialization (i.e., while
/// creating a `MidiInput` or `MidiOutput` object).
pub struct InitError;

impl Error for InitError {
    fn description(&self) -> &str {
        "MIDI support could not be initialized"
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.description().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// An error that can occur when retrieving information about
/// available ports.
pub enum PortInfoError {
    PortNumberOutOfRange,
    InvalidPort,
    CannotRetrievePortName,
}

impl Error for PortInfoError {
    fn description(&self) -> &str {
        match *self {
            PortInfoError::PortNumberOutOfRange => PORT_OUT_OF_RANGE_MSG,
            PortInfoError::InvalidPort => INVALID_PORT_MSG,
            PortInfoError::CannotRetrievePortName => CANNOT_RETRIEVE_PORT_NAME_MSG,
        }
    }
}

impl fmt::Display for PortInfoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.description().fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The kind of error for a `ConnectError`, covering every outcome an
/// `open`/`open_virtual`/`connect` call can produce.
pub enum ConnectErrorKind {
    /// The requested port index is no longer valid for the current
    /// enumeration snapshot.
    PortNumberOutOfRange,
    /// A caller-provided parameter violated a documented constraint.
    InvalidArg,
    /// The requested feature (usually a virtual endpoint) is not
    /// implemented by the current backend.
    NoBackend,
    /// The device was already open.
    AlreadyOpen,
    /// A resource allocation failed while opening the device.
    AllocFailed,
    /// An unspecified backend failure.
    Error,
    /// A backend-specific diagnostic not covered by the other variants.
    Other(&'static str),
}

impl ConnectErrorKind {
    fn description(&self) -> &str {
        match *self {
            ConnectErrorKind::PortNumberOutOfRange => PORT_OUT_OF_RANGE_MSG,
            ConnectErrorKind::InvalidArg => INVALID_ARG_MSG,
            ConnectErrorKind::NoBackend => NO_BACKEND_MSG,
            ConnectErrorKind::AlreadyOpen => ALREADY_OPEN_MSG,
            ConnectErrorKind::AllocFailed => ALLOC_FAILED_MSG,
            ConnectErrorKind::Error => "an unspecified backend error occurred",
            ConnectErrorKind::Other(msg) => msg,
        }
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.description().fmt(f)
    }
}

/// An error that can occur when trying to connect to a port. Carries
/// back the device object that was consumed by the failed call so a
/// caller can retry without re-initializing a context.
pub struct ConnectError<T> {
    kind: ConnectErrorKind,
    inner: T,
}

impl<T> ConnectError<T> {
    pub fn new(kind: ConnectErrorKind, inner: T) -> ConnectError<T> {
        ConnectError { kind, inner }
    }

    /// Helper method to create ConnectErrorKind::Other.
    pub fn other(msg: &'static str, inner: T) -> ConnectError<T> {
        Self::new(ConnectErrorKind::Other(msg), inner)
    }

    pub fn kind(&self) -> ConnectErrorKind {
        self.kind
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> fmt::Debug for ConnectError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<T> fmt::Display for ConnectError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<T> Error for ConnectError<T> {
    fn description(&self) -> &str {
        self.kind.description()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// An error that can occur when sending MIDI messages.
pub enum SendError {
    /// The message or SysEx buffer violated a documented constraint
    /// (e.g. exceeded the backend's buffer capacity).
    InvalidData(&'static str),
    /// The device is not open for output.
    NotOpen,
    /// An unspecified backend failure.
    Other(&'static str),
}

impl Error for SendError {
    fn description(&self) -> &str {
        match *self {
            SendError::InvalidData(msg) => msg,
            SendError::NotOpen => NOT_OPEN_MSG,
            SendError::Other(msg) => msg,
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.description().fmt(f)
    }
}
