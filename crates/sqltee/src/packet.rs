//! MySQL request packet classification
//!
//! Only the parts the duplication decision needs are interpreted: the 4-byte
//! header (3-byte little-endian payload length plus sequence id), the command
//! byte right after it, and the statement text of `COM_QUERY` packets.

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the packet header preceding the command byte.
pub const HEADER_LEN: usize = 4;

/// Command: close the connection
pub const COM_QUIT: u8 = 0x01;
/// Command: switch default database
pub const COM_INIT_DB: u8 = 0x02;
/// Command: text protocol query
pub const COM_QUERY: u8 = 0x03;
/// Command: list table columns
pub const COM_FIELD_LIST: u8 = 0x04;
/// Command: process list
pub const COM_PROCESS_INFO: u8 = 0x0a;
/// Command: re-authenticate as another user
pub const COM_CHANGE_USER: u8 = 0x11;
/// Command: create prepared statement
pub const COM_STMT_PREPARE: u8 = 0x16;
/// Command: execute prepared statement
pub const COM_STMT_EXECUTE: u8 = 0x17;
/// Command: stream parameter data to a prepared statement
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
/// Command: close prepared statement
pub const COM_STMT_CLOSE: u8 = 0x19;
/// Command: reset prepared statement
pub const COM_STMT_RESET: u8 = 0x1a;
/// Command: set connection option (multi-statement toggle)
pub const COM_SET_OPTION: u8 = 0x1b;

/// Commands that change server-side session state and therefore always go to
/// the branch, whatever the statement matchers say.
pub const CONSISTENCY_COMMANDS: [u8; 9] = [
    COM_QUIT,
    COM_INIT_DB,
    COM_CHANGE_USER,
    COM_STMT_PREPARE,
    COM_STMT_EXECUTE,
    COM_STMT_SEND_LONG_DATA,
    COM_STMT_CLOSE,
    COM_STMT_RESET,
    COM_SET_OPTION,
];

/// Returns true for commands that must be mirrored to keep the branch
/// session's state consistent with the primary.
pub fn is_consistency_command(command: u8) -> bool {
    CONSISTENCY_COMMANDS.contains(&command)
}

/// Returns true for commands whose response may span several packets.
pub fn expects_multi_packet_reply(command: u8) -> bool {
    matches!(
        command,
        COM_QUERY
            | COM_FIELD_LIST
            | COM_PROCESS_INFO
            | COM_STMT_PREPARE
            | COM_STMT_EXECUTE
            | COM_SET_OPTION
    )
}

/// One contiguous request packet. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    /// Wraps raw packet bytes, header included.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Builds a packet for `command` followed by `body`.
    pub fn command(sequence: u8, command: u8, body: &[u8]) -> Self {
        let payload_len = body.len() + 1;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_uint_le(payload_len as u64, 3);
        buf.put_u8(sequence);
        buf.put_u8(command);
        buf.put_slice(body);
        Self { data: buf.freeze() }
    }

    /// Builds a `COM_QUERY` packet carrying `sql`.
    pub fn query(sql: &str) -> Self {
        Self::command(0, COM_QUERY, sql.as_bytes())
    }

    /// Total length in bytes, header included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the packet holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload length declared in the header, if the header is complete.
    pub fn payload_len(&self) -> Option<usize> {
        if self.data.len() < HEADER_LEN {
            return None;
        }
        let d = &self.data;
        Some(d[0] as usize | (d[1] as usize) << 8 | (d[2] as usize) << 16)
    }

    /// Command byte at offset 4; packets of 4 bytes or fewer have none.
    pub fn command_byte(&self) -> Option<u8> {
        if self.data.len() > HEADER_LEN {
            Some(self.data[HEADER_LEN])
        } else {
            None
        }
    }

    /// Byte following the command, used by `COM_SET_OPTION`.
    pub fn first_argument(&self) -> Option<u8> {
        self.data.get(HEADER_LEN + 1).copied()
    }

    /// Statement text of a `COM_QUERY` packet.
    ///
    /// The text ends where the declared payload ends or where the buffer ends,
    /// whichever comes first. Returns `None` for other commands and for text
    /// that is not valid UTF-8.
    pub fn statement(&self) -> Option<&str> {
        if self.command_byte()? != COM_QUERY {
            return None;
        }
        let declared_end = HEADER_LEN + self.payload_len()?;
        let end = declared_end.min(self.data.len());
        let start = HEADER_LEN + 1;
        if end < start {
            return None;
        }
        std::str::from_utf8(&self.data[start..end]).ok()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}
