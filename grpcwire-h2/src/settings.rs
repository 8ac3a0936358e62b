//! HTTP/2 SETTINGS parameters (RFC 9113 Section 6.5.2).

use bytes::{Buf, BufMut};

use crate::error::H2Error;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Largest legal window size, 2^31 - 1.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// A single parameter carried in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

impl Setting {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let (id, value) = match *self {
            Self::HeaderTableSize(v) => (SETTINGS_HEADER_TABLE_SIZE, v),
            Self::EnablePush(v) => (SETTINGS_ENABLE_PUSH, u32::from(v)),
            Self::MaxConcurrentStreams(v) => (SETTINGS_MAX_CONCURRENT_STREAMS, v),
            Self::InitialWindowSize(v) => (SETTINGS_INITIAL_WINDOW_SIZE, v),
            Self::MaxFrameSize(v) => (SETTINGS_MAX_FRAME_SIZE, v),
            Self::MaxHeaderListSize(v) => (SETTINGS_MAX_HEADER_LIST_SIZE, v),
        };
        buf.put_u16(id);
        buf.put_u32(value);
    }
}

/// HTTP/2 SETTINGS parameters for one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1). Default 4096.
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Default 1 (enabled).
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3). Default unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). Default 65535.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). Default 16384.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6). Default unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65535,
            max_frame_size: 16384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Client defaults: push disabled (ENABLE_PUSH=0).
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            ..Default::default()
        }
    }

    /// Server defaults. Servers never receive pushes, so ENABLE_PUSH is
    /// left out of the advertised list entirely.
    pub fn server_default() -> Self {
        Self {
            enable_push: false,
            max_concurrent_streams: Some(100),
            ..Default::default()
        }
    }

    /// The parameters we advertise in our SETTINGS frame.
    pub fn to_list(&self) -> Vec<Setting> {
        let mut list = vec![
            Setting::HeaderTableSize(self.header_table_size),
            Setting::EnablePush(self.enable_push),
        ];
        if let Some(v) = self.max_concurrent_streams {
            list.push(Setting::MaxConcurrentStreams(v));
        }
        list.push(Setting::InitialWindowSize(self.initial_window_size));
        list.push(Setting::MaxFrameSize(self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            list.push(Setting::MaxHeaderListSize(v));
        }
        list
    }

    /// Apply received parameters. Unlisted parameters keep their value.
    pub fn apply(&mut self, changes: &[Setting]) {
        for change in changes {
            match *change {
                Setting::HeaderTableSize(v) => self.header_table_size = v,
                Setting::EnablePush(v) => self.enable_push = v,
                Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
                Setting::InitialWindowSize(v) => self.initial_window_size = v,
                Setting::MaxFrameSize(v) => self.max_frame_size = v,
                Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
            }
        }
    }
}

/// Encode a parameter list as 6-byte (id: u16, value: u32) pairs.
pub fn encode<B: BufMut>(list: &[Setting], buf: &mut B) {
    for setting in list {
        setting.encode(buf);
    }
}

/// Decode a SETTINGS payload. Unknown identifiers are skipped
/// (RFC 9113 Section 6.5.2).
pub fn decode(mut buf: &[u8]) -> Result<Vec<Setting>, H2Error> {
    if !buf.len().is_multiple_of(6) {
        return Err(H2Error::FrameSize);
    }
    let mut list = Vec::with_capacity(buf.len() / 6);
    while buf.has_remaining() {
        let id = buf.get_u16();
        let value = buf.get_u32();
        let setting = match id {
            SETTINGS_HEADER_TABLE_SIZE => Setting::HeaderTableSize(value),
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(H2Error::Protocol("ENABLE_PUSH must be 0 or 1".into()));
                }
                Setting::EnablePush(value == 1)
            }
            SETTINGS_MAX_CONCURRENT_STREAMS => Setting::MaxConcurrentStreams(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(H2Error::FlowControl);
                }
                Setting::InitialWindowSize(value)
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(16384..=16_777_215).contains(&value) {
                    return Err(H2Error::Protocol("MAX_FRAME_SIZE out of range".into()));
                }
                Setting::MaxFrameSize(value)
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => Setting::MaxHeaderListSize(value),
            _ => continue,
        };
        list.push(setting);
    }
    Ok(list)
}
