// This module is not public.

#[cfg(target_os = "windows")]
mod winmm;
#[cfg(target_os = "windows")]
pub(crate) use self::winmm::*;

#[cfg(target_os = "macos")]
mod coremidi;
#[cfg(target_os = "macos")]
pub(crate) use self::coremidi::*;

#[cfg(target_os = "linux")]
mod alsa;
#[cfg(target_os = "linux")]
pub(crate) use self::alsa::*;
