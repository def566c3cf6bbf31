//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::Bytes;
use smallvec::SmallVec;

use super::codec::{MessageWriter, PayloadReader};
use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code of the SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80877103; // (1234 << 16) | 5679

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            _ => Err(PgError::Protocol(format!(
                "Unknown transaction status: {}",
                b as char
            ))),
        }
    }

    /// Whether a transaction block is open (healthy or failed).
    pub fn in_transaction(self) -> bool {
        !matches!(self, TransactionStatus::Idle)
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn write(&self, w: &mut MessageWriter);
}

/// SSLRequest packet (untagged), sent before the startup message.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(None);
        w.put_i32(SSL_REQUEST_CODE);
        w.end_message();
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(None);
        w.put_i32(PROTOCOL_VERSION);

        w.put_cstr("user");
        w.put_cstr(&self.user);

        if let Some(ref db) = self.database {
            w.put_cstr("database");
            w.put_cstr(db);
        }

        for (key, value) in &self.options {
            w.put_cstr(key);
            w.put_cstr(value);
        }

        // Terminator
        w.put_u8(0);
        w.end_message();
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'p'));
        w.put_cstr(&self.password);
        w.end_message();
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'p'));
        w.put_cstr(&self.mechanism);
        w.put_i32(self.data.len() as i32);
        w.put_bytes(&self.data);
        w.end_message();
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'p'));
        w.put_bytes(&self.data);
        w.end_message();
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'Q'));
        w.put_cstr(self.query);
        w.end_message();
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'P'));
        w.put_cstr(self.name);
        w.put_cstr(self.query);
        w.put_i16(self.param_types.len() as i16);
        for oid in self.param_types {
            w.put_i32(oid.as_i32());
        }
        w.end_message();
    }
}

/// Bind message ('B') - Binds text-format parameters to a statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    /// Text values; `None` is NULL
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'B'));
        w.put_cstr(self.portal);
        w.put_cstr(self.statement);

        // One format code applying to every parameter
        w.put_i16(1);
        w.put_i16(Format::Text as i16);

        w.put_i16(self.params.len() as i16);
        for param in self.params {
            match param {
                None => w.put_i32(-1),
                Some(text) => {
                    w.put_i32(text.len() as i32);
                    w.put_bytes(text.as_bytes());
                }
            }
        }

        // All result columns in text format
        w.put_i16(1);
        w.put_i16(Format::Text as i16);
        w.end_message();
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'D'));
        w.put_u8(self.kind);
        w.put_cstr(self.name);
        w.end_message();
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'E'));
        w.put_cstr(self.portal);
        w.put_i32(self.max_rows);
        w.end_message();
    }
}

/// Close message ('C') - Closes a statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'C'));
        w.put_u8(self.kind);
        w.put_cstr(self.name);
        w.end_message();
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'S'));
        w.end_message();
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'H'));
        w.end_message();
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn write(&self, w: &mut MessageWriter) {
        w.begin_message(Some(b'X'));
        w.end_message();
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },
    /// Any other authentication request code
    AuthenticationUnsupported { code: i32 },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: SmallVec<[Option<Bytes>; 16]> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Asynchronous notification
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode a backend message from its tag and payload.
    pub fn parse(tag: u8, payload: Bytes) -> PgResult<Self> {
        let mut body = PayloadReader::new(payload);

        match tag {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: body.get_cstr()?,
            }),
            b'Z' => Ok(BackendMessage::ReadyForQuery {
                status: TransactionStatus::from_byte(body.get_u8()?)?,
            }),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: body.get_cstr()?,
                value: body.get_cstr()?,
            }),
            b'K' => Ok(BackendMessage::BackendKeyData {
                process_id: body.get_i32()?,
                secret_key: body.get_i32()?,
            }),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Ok(BackendMessage::NotificationResponse {
                process_id: body.get_i32()?,
                channel: body.get_cstr()?,
                payload: body.get_cstr()?,
            }),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                tag as char
            ))),
        }
    }

    fn decode_auth(mut body: PayloadReader) -> PgResult<Self> {
        let auth_type = body.get_i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.get_bytes(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = body.get_cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body.rest() }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body.rest() }),
            code => Ok(BackendMessage::AuthenticationUnsupported { code }),
        }
    }

    fn decode_row_description(mut body: PayloadReader) -> PgResult<Self> {
        let num_fields = body.get_i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = body.get_cstr()?;
            let table_oid = body.get_i32()?;
            let column_attr = body.get_i16()?;
            let type_oid = Oid::from_i32(body.get_i32()?);
            let type_size = body.get_i16()?;
            let type_modifier = body.get_i32()?;
            let format = if body.get_i16()? == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: PayloadReader) -> PgResult<Self> {
        let num_cols = body.get_i16()?.max(0) as usize;
        let mut values = SmallVec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.get_i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.get_bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(mut body: PayloadReader) -> PgResult<Self> {
        let num_params = body.get_i16()?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.get_i32()?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

/// Read error/notice response fields
fn read_error_fields(mut body: PayloadReader) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8()?;
        if field_type == 0 {
            break;
        }
        let value = body.get_cstr()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Rows affected from a command tag: its trailing integer, if any.
///
/// - "INSERT 0 5" -> 5
/// - "UPDATE 3" -> 3
/// - "BEGIN" -> 0
pub fn parse_rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
