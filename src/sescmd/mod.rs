//! Session-command log.
//!
//! Statements that mutate per-connection server state (SET, USE, charset
//! changes, prepared-statement registration) must reach every backend the
//! session ever attaches, in the order they were issued. The log is the
//! single owner of the command payloads; backends remember only positions.

use std::collections::VecDeque;

use bytes::Bytes;

/// One recorded session command
#[derive(Debug, Clone)]
pub struct SessionCommand {
    position: u64,
    buffer: Bytes,
    command: u8,
    reply_received: bool,
    /// Header byte of the reference backend's reply, once received
    reference_reply: Option<u8>,
}

impl SessionCommand {
    fn new(position: u64, buffer: Bytes) -> Self {
        let command = buffer.first().copied().unwrap_or(0);
        Self {
            position,
            buffer,
            command,
            reply_received: false,
            reference_reply: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn buffer(&self) -> Bytes {
        self.buffer.clone()
    }

    pub fn is_reply_received(&self) -> bool {
        self.reply_received
    }

    pub fn reference_reply(&self) -> Option<u8> {
        self.reference_reply
    }

    /// Record the reference reply. Once set it is never cleared.
    pub fn mark_reply_received(&mut self, header_byte: u8) {
        if !self.reply_received {
            self.reply_received = true;
            self.reference_reply = Some(header_byte);
        }
    }
}

/// Ordered, position-stamped log of session commands
#[derive(Debug)]
pub struct SessionCommandLog {
    entries: VecDeque<SessionCommand>,
    next_position: u64,
    max_history: usize,
    history_disabled: bool,
    /// Set when a disabled-history log overflowed and was cleared; the
    /// session may no longer attach new backends mid-flight.
    attach_disabled: bool,
}

impl SessionCommandLog {
    pub fn new(max_history: usize, history_disabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            next_position: 1,
            max_history,
            history_disabled,
            attach_disabled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// New backends may only attach while the full history is intact
    pub fn can_attach_backends(&self) -> bool {
        !self.attach_disabled
    }

    /// Append a command, returning its position id.
    ///
    /// On overflow either the whole history is dropped and further backend
    /// attachment refused (history disabled), or the oldest entries are
    /// silently discarded.
    pub fn add(&mut self, buffer: Bytes) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.entries.push_back(SessionCommand::new(position, buffer));

        if self.max_history > 0 && self.entries.len() > self.max_history {
            if self.history_disabled {
                self.entries.clear();
                self.attach_disabled = true;
            } else {
                while self.entries.len() > self.max_history {
                    self.entries.pop_front();
                }
            }
        }

        position
    }

    pub fn get_mut(&mut self, position: u64) -> Option<&mut SessionCommand> {
        self.entries
            .iter_mut()
            .find(|cmd| cmd.position() == position)
    }

    pub fn get(&self, position: u64) -> Option<&SessionCommand> {
        self.entries.iter().find(|cmd| cmd.position() == position)
    }

    /// Commands with a position greater than `after`, in position order.
    /// This is the replay sequence for a newly attached backend.
    pub fn replay_from(&self, after: u64) -> impl Iterator<Item = &SessionCommand> {
        self.entries.iter().filter(move |cmd| cmd.position() > after)
    }

    /// Discard entries every live backend has acknowledged, keeping at
    /// least the newest entry so late joiners can be position-checked.
    pub fn trim(&mut self, min_acknowledged: u64) {
        while self.entries.len() > 1 {
            match self.entries.front() {
                Some(cmd) if cmd.position() <= min_acknowledged => {
                    self.entries.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Highest position handed out so far
    pub fn last_position(&self) -> u64 {
        self.next_position - 1
    }
}
