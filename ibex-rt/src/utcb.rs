//! Message-transfer frames.
//!
//! A [`UtcbFrame`] wraps the per-call message buffer: untyped machine words
//! plus typed capability items (delegations and translations). The same
//! frame type serves both sides of a portal call. The caller fills it, the
//! handler reads the request out of it and writes the reply back into it,
//! and after the call returns the read cursor is reset so the caller can
//! iterate the response from the start.
//!
//! Received typed items are consumed strictly in arrival order by
//! [`UtcbFrame::take_delegated`] / [`UtcbFrame::take_translated`]; there is
//! no positional access.

use std::collections::VecDeque;

use ibex_abi::error::ErrorCode;
use ibex_abi::wire::{Wire, WordReader, WordWriter};
use ibex_abi::{CapRange, CapSel};

use crate::env::Env;
use crate::error::{Error, Result};

/// A typed item attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedItem {
    /// Delegate a selector range to the receiver's window.
    Delegate(CapRange),
    /// Let the receiver look up a selector it already knows.
    Translate(CapSel),
}

/// Raw transfer representation of a frame's outgoing state.
pub(crate) struct FrameData {
    pub words: Vec<u64>,
    pub typed: Vec<TypedItem>,
}

/// Stack-discipline wrapper around a message-transfer buffer.
pub struct UtcbFrame {
    words: Vec<u64>,
    upos: usize,
    typed: Vec<TypedItem>,
    delegated: VecDeque<CapRange>,
    translated: VecDeque<CapSel>,
    /// Every delegated range that landed during the current transfer,
    /// consumed or not; this is what an error path revokes.
    landed: Vec<CapRange>,
    window: Option<CapRange>,
}

impl UtcbFrame {
    /// An empty frame.
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            upos: 0,
            typed: Vec::new(),
            delegated: VecDeque::new(),
            translated: VecDeque::new(),
            landed: Vec::new(),
            window: None,
        }
    }

    // -------------------------------------------------------------------
    // Untyped words
    // -------------------------------------------------------------------

    /// Append a typed value to the untyped words.
    pub fn put<T: Wire>(&mut self, value: T) {
        value.put(&mut WordWriter::new(&mut self.words));
    }

    /// Append a string to the untyped words.
    pub fn put_str(&mut self, s: &str) {
        WordWriter::new(&mut self.words).push_bytes(s.as_bytes());
    }

    /// Read the next typed value from the untyped words.
    pub fn get<T: Wire>(&mut self) -> Result<T> {
        let mut reader = WordReader::new(&self.words, self.upos);
        let value = T::get(&mut reader)?;
        self.upos = reader.position();
        Ok(value)
    }

    /// Read the leading [`ErrorCode`] of a reply and turn it into a
    /// `Result`.
    pub fn check_reply(&mut self) -> Result<()> {
        let code: ErrorCode = self.get()?;
        match Error::from_code(code) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Number of unread untyped words.
    pub fn remaining(&self) -> usize {
        self.words.len().saturating_sub(self.upos)
    }

    /// Assert that the request has been consumed completely.
    ///
    /// Call this after reading all expected input and before writing the
    /// reply; trailing words mean the caller sent something this handler
    /// does not understand.
    pub fn finish_input(&mut self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ArgsInvalid);
        }
        // The consumed request must not leak into the reply.
        self.words.clear();
        self.upos = 0;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Typed items
    // -------------------------------------------------------------------

    /// Attach a delegation of `range` to the frame.
    pub fn delegate(&mut self, range: CapRange) {
        self.typed.push(TypedItem::Delegate(range));
    }

    /// Attach a translation of `sel` to the frame.
    pub fn translate(&mut self, sel: CapSel) {
        self.typed.push(TypedItem::Translate(sel));
    }

    /// Consume the next received delegation, in arrival order.
    pub fn take_delegated(&mut self) -> Result<CapRange> {
        self.delegated.pop_front().ok_or(Error::ArgsInvalid)
    }

    /// Consume the next received translation, in arrival order.
    pub fn take_translated(&mut self) -> Result<CapSel> {
        self.translated.pop_front().ok_or(Error::ArgsInvalid)
    }

    /// Designate the selector range that incoming delegations should land
    /// in. Without a window, a reply carrying delegations fails the call.
    pub fn set_window(&mut self, range: CapRange) {
        self.window = Some(range);
    }

    /// The currently designated receive window.
    pub fn window(&self) -> Option<CapRange> {
        self.window
    }

    // -------------------------------------------------------------------
    // Error-path cleanup
    // -------------------------------------------------------------------

    /// Remove every delegation that landed during this transfer from the
    /// capability space.
    ///
    /// Handlers call this before writing an error reply so clients never
    /// observe partial delegation on failure.
    pub fn drop_delegations(&mut self, env: &Env) {
        for range in self.landed.drain(..) {
            for sel in range.base..range.end() {
                env.space().remove(sel);
            }
        }
        self.delegated.clear();
    }

    /// Wipe words, cursors and typed items. The receive window survives.
    pub fn clear(&mut self) {
        self.words.clear();
        self.upos = 0;
        self.typed.clear();
        self.delegated.clear();
        self.translated.clear();
    }

    // -------------------------------------------------------------------
    // Transfer plumbing
    // -------------------------------------------------------------------

    /// Detach the outgoing state for a portal transfer.
    pub(crate) fn take_outgoing(&mut self) -> FrameData {
        self.upos = 0;
        FrameData {
            words: std::mem::take(&mut self.words),
            typed: std::mem::take(&mut self.typed),
        }
    }

    /// Install a reply: words replace the frame contents, cursors reset,
    /// and the received typed items become consumable.
    pub(crate) fn load_reply(
        &mut self,
        words: Vec<u64>,
        delegated: VecDeque<CapRange>,
        translated: VecDeque<CapSel>,
    ) {
        self.words = words;
        self.upos = 0;
        self.typed.clear();
        self.landed.clear();
        self.landed.extend(delegated.iter().copied());
        self.delegated = delegated;
        self.translated = translated;
    }

    /// Build the handler-side frame for an incoming request.
    pub(crate) fn for_handler(
        words: Vec<u64>,
        delegated: VecDeque<CapRange>,
        translated: VecDeque<CapSel>,
    ) -> Self {
        let landed = delegated.iter().copied().collect();
        Self {
            words,
            upos: 0,
            typed: Vec::new(),
            delegated,
            translated,
            landed,
            window: None,
        }
    }
}

impl Default for UtcbFrame {
    fn default() -> Self {
        Self::new()
    }
}
