//! HTTP/2 flow control window tracking (RFC 9113 Section 6.9).
//!
//! Outbound credit is a plain signed counter ([`FlowControl`]). Inbound
//! credit is managed by [`WindowManager`], which only re-opens the window
//! for bytes the application has acknowledged as processed.

use crate::error::H2Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Default initial window size (RFC 9113 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

/// Tracks an outbound flow control window.
#[derive(Debug, Clone)]
pub struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub fn new(initial: i64) -> Self {
        Self { window: initial }
    }

    /// Current window size (may be negative after a SETTINGS change).
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Consume `amount` bytes. Fails without changing the window if it
    /// would go below zero.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(H2Error::FlowControl);
        }
        self.window = new;
        Ok(())
    }

    /// Add `increment` from a WINDOW_UPDATE. Fails past 2^31 - 1.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(increment))
    }

    /// Shift the window after INITIAL_WINDOW_SIZE changes.
    /// `delta` is (new_initial - old_initial), which can be negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let new = self.window + delta;
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControl);
        }
        self.window = new;
        Ok(())
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Inbound window bookkeeping for a connection or a stream.
///
/// Received DATA shrinks the window immediately. The window only grows
/// again when the application reports bytes as processed, and a
/// WINDOW_UPDATE is only worth sending once enough has accumulated.
#[derive(Debug, Clone)]
pub struct WindowManager {
    max_window: i64,
    current_window: i64,
    bytes_processed: i64,
}

impl WindowManager {
    pub fn new(max_window: u32) -> Self {
        Self {
            max_window: i64::from(max_window),
            current_window: i64::from(max_window),
            bytes_processed: 0,
        }
    }

    /// Credit the peer may still use.
    pub fn window(&self) -> i64 {
        self.current_window
    }

    /// Peer sent `size` flow-controlled bytes.
    pub fn window_consumed(&mut self, size: u32) -> Result<(), H2Error> {
        self.current_window -= i64::from(size);
        if self.current_window < 0 {
            return Err(H2Error::FlowControl);
        }
        Ok(())
    }

    /// We sent a WINDOW_UPDATE of `size` outside of `process_bytes`; the
    /// target window grows with it.
    pub fn window_opened(&mut self, size: u32) {
        self.current_window += i64::from(size);
        self.max_window = self.max_window.max(self.current_window);
    }

    /// Local INITIAL_WINDOW_SIZE changed to `new_max`.
    pub fn set_max_window(&mut self, new_max: u32) {
        let delta = i64::from(new_max) - self.max_window;
        self.max_window = i64::from(new_max);
        self.current_window += delta;
    }

    /// Application processed `size` bytes. Returns the WINDOW_UPDATE
    /// increment to send, if one is due.
    pub fn process_bytes(&mut self, size: u32) -> Option<u32> {
        self.bytes_processed += i64::from(size);
        self.maybe_update_window()
    }

    fn maybe_update_window(&mut self) -> Option<u32> {
        if self.bytes_processed <= 0 {
            return None;
        }
        let max_increment = self.max_window - self.current_window;
        let exhausted = self.current_window <= 0
            && self.bytes_processed > (self.max_window / 4).min(1024);
        let half_used = self.bytes_processed >= self.max_window / 2;
        if !(exhausted || half_used) {
            return None;
        }
        let increment = self.bytes_processed.min(max_increment);
        self.bytes_processed = 0;
        if increment <= 0 {
            return None;
        }
        self.current_window += increment;
        Some(increment as u32)
    }
}
