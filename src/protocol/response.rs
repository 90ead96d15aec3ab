//! Reply-stream tracking for backend responses.
//!
//! Every backend connection carries a `ReplyTracker` that consumes the
//! packets of a reply and knows when a complete response has been received.
//! Multi-result replies (stored procedures, multi-statement payloads) loop
//! through the states once per result, chained by the
//! SERVER_MORE_RESULTS_EXISTS status flag.

use bytes::Bytes;

use super::handshake::{
    eof_status_flags, is_eof_packet, is_err_packet, is_local_infile_packet, is_ok_packet,
    ok_status_flags,
};
use super::packet::{get_lenenc_int, status_flags::SERVER_MORE_RESULTS_EXISTS};

/// Where in a reply stream a backend currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Query sent, first response packet not yet seen
    Start,
    /// Complete reply received
    Done,
    /// Resultset response, reading column definitions
    RsetColdef,
    /// Resultset response, reading rows
    RsetRows,
}

impl ReplyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyState::Start => "START",
            ReplyState::Done => "DONE",
            ReplyState::RsetColdef => "RSET_COLDEF",
            ReplyState::RsetRows => "RSET_ROWS",
        }
    }
}

/// What kind of reply the backend owes for the dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    /// OK / ERR / resultset, possibly chained by MORE_RESULTS
    Query,
    /// COM_STMT_PREPARE: OK header, then parameter and column definitions
    Prepare,
    /// COM_FIELD_LIST: column definitions straight away, terminated by EOF
    FieldList,
    /// One bare packet, e.g. the COM_STATISTICS string
    SinglePacket,
}

/// Per-backend reply stream tracker
#[derive(Debug)]
pub struct ReplyTracker {
    state: ReplyState,
    kind: ReplyKind,
    columns_expected: u64,
    /// EOF packets still owed by a prepare reply
    prepare_eofs: u8,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self {
            state: ReplyState::Done,
            kind: ReplyKind::Query,
            columns_expected: 0,
            prepare_eofs: 0,
        }
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ReplyState::Done
    }

    /// Arm the tracker for a freshly dispatched query
    pub fn start_query(&mut self) {
        self.start(ReplyKind::Query);
    }

    /// Arm the tracker for a COM_STMT_PREPARE reply
    pub fn start_prepare(&mut self) {
        self.start(ReplyKind::Prepare);
    }

    /// Arm the tracker for a COM_FIELD_LIST reply
    pub fn start_field_list(&mut self) {
        self.start(ReplyKind::FieldList);
    }

    /// Arm the tracker for a command answered by one bare packet
    pub fn start_single_packet(&mut self) {
        self.start(ReplyKind::SinglePacket);
    }

    fn start(&mut self, kind: ReplyKind) {
        self.state = ReplyState::Start;
        self.kind = kind;
        self.columns_expected = 0;
        self.prepare_eofs = 0;
    }

    /// Consume one reply packet and advance the state machine.
    ///
    /// Returns the state after the packet; the reply is complete when the
    /// returned state is `Done`.
    pub fn process(&mut self, payload: &Bytes) -> ReplyState {
        self.state = match self.state {
            ReplyState::Start => match self.kind {
                ReplyKind::SinglePacket => ReplyState::Done,
                ReplyKind::FieldList => {
                    if is_err_packet(payload) || is_eof_packet(payload) {
                        ReplyState::Done
                    } else {
                        ReplyState::RsetColdef
                    }
                }
                ReplyKind::Prepare => {
                    if is_ok_packet(payload) {
                        // COM_STMT_PREPARE_OK: status, stmt id, column and
                        // parameter counts follow the header
                        let num_columns = read_u16_le(payload, 5);
                        let num_params = read_u16_le(payload, 7);
                        self.columns_expected = (num_columns + num_params) as u64;
                        self.prepare_eofs =
                            (num_columns > 0) as u8 + (num_params > 0) as u8;
                        if self.prepare_eofs == 0 {
                            ReplyState::Done
                        } else {
                            ReplyState::RsetColdef
                        }
                    } else {
                        ReplyState::Done
                    }
                }
                ReplyKind::Query => {
                    if is_err_packet(payload) || is_local_infile_packet(payload) {
                        ReplyState::Done
                    } else if is_ok_packet(payload) {
                        if ok_status_flags(payload) & SERVER_MORE_RESULTS_EXISTS != 0 {
                            ReplyState::Start
                        } else {
                            ReplyState::Done
                        }
                    } else {
                        self.columns_expected =
                            get_lenenc_int(payload).map(|(v, _)| v).unwrap_or(0);
                        ReplyState::RsetColdef
                    }
                }
            },
            ReplyState::RsetColdef => {
                if is_eof_packet(payload) {
                    match self.kind {
                        ReplyKind::Prepare => {
                            self.prepare_eofs = self.prepare_eofs.saturating_sub(1);
                            if self.prepare_eofs == 0 {
                                ReplyState::Done
                            } else {
                                ReplyState::RsetColdef
                            }
                        }
                        ReplyKind::FieldList => ReplyState::Done,
                        _ => ReplyState::RsetRows,
                    }
                } else {
                    ReplyState::RsetColdef
                }
            }
            ReplyState::RsetRows => {
                if is_err_packet(payload) {
                    ReplyState::Done
                } else if is_eof_packet(payload) {
                    if eof_status_flags(payload) & SERVER_MORE_RESULTS_EXISTS != 0 {
                        ReplyState::Start
                    } else {
                        ReplyState::Done
                    }
                } else {
                    ReplyState::RsetRows
                }
            }
            // A packet while DONE is a protocol violation from the backend;
            // swallow it without changing state.
            ReplyState::Done => ReplyState::Done,
        };

        self.state
    }

    /// Column count announced by the current resultset
    pub fn column_count(&self) -> u64 {
        self.columns_expected
    }
}

fn read_u16_le(payload: &[u8], offset: usize) -> u16 {
    match (payload.get(offset), payload.get(offset + 1)) {
        (Some(&lo), Some(&hi)) => u16::from_le_bytes([lo, hi]),
        _ => 0,
    }
}

/// The identifying parts of a ColumnDefinition41 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub org_table: String,
    pub org_name: String,
}

impl ColumnDef {
    /// Parse schema, org_table and org_name out of a column definition payload.
    ///
    /// Layout: catalog, schema, table, org_table, name, org_name as
    /// length-encoded strings, followed by fixed fields we do not need.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut pos = 0;
        let mut fields = [None::<&[u8]>; 6];

        for slot in fields.iter_mut() {
            let (len, consumed) = get_lenenc_int(payload.get(pos..)?)?;
            pos += consumed;
            let bytes = payload.get(pos..pos + len as usize)?;
            pos += len as usize;
            *slot = Some(bytes);
        }

        Some(Self {
            schema: String::from_utf8_lossy(fields[1]?).to_string(),
            org_table: String::from_utf8_lossy(fields[3]?).to_string(),
            org_name: String::from_utf8_lossy(fields[5]?).to_string(),
        })
    }
}

/// Byte range of one value inside a text-protocol row payload, or None for NULL
pub type RowValue = Option<std::ops::Range<usize>>;

/// Walk the length-encoded values of a text-protocol row payload.
///
/// Yields one entry per column: the byte range of the value inside the
/// payload, or `None` for a NULL (0xFB) marker. Stops at a malformed tail.
pub fn row_values(payload: &[u8]) -> Vec<RowValue> {
    let mut values = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        if payload[pos] == 0xFB {
            values.push(None);
            pos += 1;
            continue;
        }
        let Some((len, consumed)) = get_lenenc_int(&payload[pos..]) else {
            break;
        };
        let start = pos + consumed;
        let end = start + len as usize;
        if end > payload.len() {
            break;
        }
        values.push(Some(start..end));
        pos = end;
    }

    values
}
