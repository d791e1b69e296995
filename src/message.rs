//! Messages: the header/body envelope exchanged over a `Connection`.
//!
//! Grounded on `message.rs` of the teacher crate for the overall shape
//! (`Header`, `MessageType`, `HeaderFlags`, `HeaderFieldCode`) and on
//! `original_source/client/message.cpp`/`message_p.h` for the actual wire
//! layout, which the teacher's `Body` never got around to implementing.
//! Two teacher bugs are deliberately not reproduced here: `MAX_MESSAGE_SIZE`
//! was `2 ^ 27` (bitwise XOR, evaluating to 25) instead of `2u32.pow(27)`,
//! and `write_string` terminated with `b'\n'` instead of a NUL byte.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::marshal::{signature, Arguments, Reader, Writer};
use crate::types::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath, Serial, Signature};

/// The largest message this crate will write or accept, matching the
/// reference D-Bus implementation's limit of 2^27 bytes (128 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 1 << 27;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

const ENDIAN_LITTLE: u8 = b'l';
const ENDIAN_BIG: u8 = b'B';

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<MessageType, Error> {
        match v {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            _ => Err(Error::MalformedMessage("unknown message type")),
        }
    }
}

bitflags! {
    #[derive(Default)]
    pub struct HeaderFlags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const NO_AUTO_START = 0x02;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x04;
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderFieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// The fixed-position fields plus the variable header-field array.
#[derive(Clone, Debug)]
pub struct Header {
    pub message_type: MessageType,
    pub flags: HeaderFlags,
    pub serial: Serial,
    pub path: Option<ObjectPath>,
    pub interface: Option<InterfaceName>,
    pub member: Option<MemberName>,
    pub error_name: Option<ErrorName>,
    pub reply_serial: Option<Serial>,
    pub destination: Option<BusName>,
    pub sender: Option<BusName>,
    pub signature: Signature,
    pub unix_fds: u32,
}

impl Header {
    fn required_field_for_type(&self) -> Result<(), Error> {
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(Error::MalformedMessage(
                        "method call requires PATH and MEMBER header fields",
                    ));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(Error::MalformedMessage(
                        "signal requires PATH, INTERFACE and MEMBER header fields",
                    ));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() || self.reply_serial.is_none() {
                    return Err(Error::MalformedMessage(
                        "error requires ERROR_NAME and REPLY_SERIAL header fields",
                    ));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(Error::MalformedMessage(
                        "method return requires REPLY_SERIAL header field",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A full message: header plus its marshalled body.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub body: Arguments,
    /// File descriptors attached to this message (SCM_RIGHTS), in the
    /// order referenced by `UnixFd` arguments in the body. Capped at 16.
    pub fds: Vec<std::os::unix::io::RawFd>,
}

impl Message {
    pub fn method_call(path: ObjectPath, member: MemberName) -> Message {
        Message {
            header: Header {
                message_type: MessageType::MethodCall,
                flags: HeaderFlags::empty(),
                serial: Serial(1),
                path: Some(path),
                interface: None,
                member: Some(member),
                error_name: None,
                reply_serial: None,
                destination: None,
                sender: None,
                signature: Signature::new_unchecked(String::new()),
                unix_fds: 0,
            },
            body: Arguments::empty(),
            fds: Vec::new(),
        }
    }

    pub fn signal(path: ObjectPath, interface: InterfaceName, member: MemberName) -> Message {
        Message {
            header: Header {
                message_type: MessageType::Signal,
                flags: HeaderFlags::empty(),
                serial: Serial(1),
                path: Some(path),
                interface: Some(interface),
                member: Some(member),
                error_name: None,
                reply_serial: None,
                destination: None,
                sender: None,
                signature: Signature::new_unchecked(String::new()),
                unix_fds: 0,
            },
            body: Arguments::empty(),
            fds: Vec::new(),
        }
    }

    pub fn method_return(reply_to: &Header) -> Message {
        Message {
            header: Header {
                message_type: MessageType::MethodReturn,
                flags: HeaderFlags::empty(),
                serial: Serial(1),
                path: None,
                interface: None,
                member: None,
                error_name: None,
                reply_serial: Some(reply_to.serial),
                destination: reply_to.sender.clone(),
                sender: None,
                signature: Signature::new_unchecked(String::new()),
                unix_fds: 0,
            },
            body: Arguments::empty(),
            fds: Vec::new(),
        }
    }

    pub fn error_reply(reply_to: &Header, error_name: ErrorName) -> Message {
        Message {
            header: Header {
                message_type: MessageType::Error,
                flags: HeaderFlags::empty(),
                serial: Serial(1),
                path: None,
                interface: None,
                member: None,
                error_name: Some(error_name),
                reply_serial: Some(reply_to.serial),
                destination: reply_to.sender.clone(),
                sender: None,
                signature: Signature::new_unchecked(String::new()),
                unix_fds: 0,
            },
            body: Arguments::empty(),
            fds: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: BusName) -> Message {
        self.header.destination = Some(destination);
        self
    }

    pub fn with_body(mut self, body: Arguments) -> Message {
        self.header.signature = body.signature.clone();
        self.body = body;
        self
    }

    pub fn no_reply_expected(mut self) -> Message {
        self.header.flags.insert(HeaderFlags::NO_REPLY_EXPECTED);
        self
    }

    pub(crate) fn with_serial(mut self, serial: Serial) -> Message {
        self.header.serial = serial;
        self
    }

    pub fn body_reader(&self) -> Result<Reader<'_>, Error> {
        Reader::new(&self.body.data, self.header.signature.as_str())
    }

    /// Serializes the message to wire bytes. Always writes little-endian,
    /// per the scope note in the design document.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        self.header.required_field_for_type()?;
        if self.fds.len() > 16 {
            return Err(Error::TooManyFds);
        }

        let fields_args = write_header_fields(&self.header)?;

        let mut out = Vec::with_capacity(16 + fields_args.data.len() + self.body.data.len());
        out.push(ENDIAN_LITTLE);
        out.push(self.header.message_type as u8);
        out.push(self.header.flags.bits());
        out.push(PROTOCOL_VERSION);
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, self.body.data.len() as u32);
        out.extend_from_slice(&tmp);
        LittleEndian::write_u32(&mut tmp, self.header.serial.get());
        out.extend_from_slice(&tmp);
        LittleEndian::write_u32(&mut tmp, fields_args.data.len() as u32);
        out.extend_from_slice(&tmp);
        out.extend_from_slice(&fields_args.data);

        let pad = crate::marshal::padding_for(out.len(), 8);
        out.extend(std::iter::repeat(0u8).take(pad));

        if out.len() as u64 + self.body.data.len() as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(Error::MalformedMessage("message exceeds maximum size"));
        }
        out.extend_from_slice(&self.body.data);
        Ok(out)
    }

    /// Parses a complete message (header + body) out of `data`, returning
    /// the message and the number of bytes consumed. The connection's
    /// receive pipeline is responsible for first peeking the fixed
    /// 16-byte prologue to learn how many bytes to wait for before
    /// calling this at all; this function assumes `data` already holds a
    /// full message.
    pub fn deserialize(data: &[u8]) -> Result<(Message, usize), Error> {
        if data.len() < 16 {
            return Err(Error::MalformedMessage("truncated message prologue"));
        }
        if data[0] != ENDIAN_LITTLE {
            if data[0] == ENDIAN_BIG {
                return Err(Error::MalformedMessage(
                    "big-endian messages are not supported by this build",
                ));
            }
            return Err(Error::MalformedMessage("unknown endianness flag"));
        }
        let message_type = MessageType::from_u8(data[1])?;
        let flags = HeaderFlags::from_bits_truncate(data[2]);
        if data[3] != PROTOCOL_VERSION {
            return Err(Error::MalformedMessage("unsupported protocol version"));
        }
        let body_len = LittleEndian::read_u32(&data[4..8]);
        if body_len > MAX_MESSAGE_SIZE {
            return Err(Error::MalformedMessage("declared body length exceeds maximum"));
        }
        let serial = Serial::try_from_wire(LittleEndian::read_u32(&data[8..12]))?;
        let fields_len = LittleEndian::read_u32(&data[12..16]) as usize;

        let fields_start: usize = 16;
        let fields_end = fields_start
            .checked_add(fields_len)
            .ok_or(Error::MalformedMessage("header field array length overflow"))?;
        if fields_end > data.len() {
            return Err(Error::MalformedMessage("truncated header fields"));
        }

        let fields = read_header_fields(&data[fields_start..fields_end])?;

        let header_unpadded_end = fields_end;
        let body_start = header_unpadded_end + crate::marshal::padding_for(header_unpadded_end, 8);
        let body_end = body_start
            .checked_add(body_len as usize)
            .ok_or(Error::MalformedMessage("body length overflow"))?;
        if body_end > data.len() {
            return Err(Error::MalformedMessage("truncated message body"));
        }

        let header = Header {
            message_type,
            flags,
            serial,
            path: fields.path,
            interface: fields.interface,
            member: fields.member,
            error_name: fields.error_name,
            reply_serial: fields.reply_serial,
            destination: fields.destination,
            sender: fields.sender,
            signature: fields.signature.unwrap_or_else(|| Signature::new_unchecked(String::new())),
            unix_fds: fields.unix_fds.unwrap_or(0),
        };
        header.required_field_for_type()?;

        let body = Arguments::new(header.signature.clone(), data[body_start..body_end].to_vec());

        Ok((
            Message {
                header,
                body,
                fds: Vec::new(),
            },
            body_end,
        ))
    }
}

impl Serial {
    fn try_from_wire(v: u32) -> Result<Serial, Error> {
        std::convert::TryFrom::try_from(v)
    }
}

fn write_header_fields(header: &Header) -> Result<Arguments, Error> {
    if header_field_count(header) == 0 {
        signature::validate("a(yv)")?;
        return Ok(Arguments::new(Signature::new_unchecked("a(yv)"), Vec::new()));
    }

    let mut w = Writer::new();
    w.begin_array()?;

    if let Some(p) = &header.path {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Path as u8)?;
        w.begin_variant()?;
        w.write_object_path(p)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = &header.interface {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Interface as u8)?;
        w.begin_variant()?;
        w.write_string(v)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = &header.member {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Member as u8)?;
        w.begin_variant()?;
        w.write_string(v)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = &header.error_name {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::ErrorName as u8)?;
        w.begin_variant()?;
        w.write_string(v)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = header.reply_serial {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::ReplySerial as u8)?;
        w.begin_variant()?;
        w.write_u32(v.get())?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = &header.destination {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Destination as u8)?;
        w.begin_variant()?;
        w.write_string(v)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if let Some(v) = &header.sender {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Sender as u8)?;
        w.begin_variant()?;
        w.write_string(v)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if !header.signature.is_empty() {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::Signature as u8)?;
        w.begin_variant()?;
        w.write_signature(&header.signature)?;
        w.end_variant()?;
        w.end_struct()?;
    }
    if header.unix_fds > 0 {
        w.begin_struct()?;
        w.write_byte(HeaderFieldCode::UnixFds as u8)?;
        w.begin_variant()?;
        w.write_u32(header.unix_fds)?;
        w.end_variant()?;
        w.end_struct()?;
    }

    w.end_array()?;
    w.finish()
}

fn header_field_count(header: &Header) -> usize {
    [
        header.path.is_some(),
        header.interface.is_some(),
        header.member.is_some(),
        header.error_name.is_some(),
        header.reply_serial.is_some(),
        header.destination.is_some(),
        header.sender.is_some(),
        !header.signature.is_empty(),
        header.unix_fds > 0,
    ]
    .iter()
    .filter(|b| **b)
    .count()
}

struct ParsedFields {
    path: Option<ObjectPath>,
    interface: Option<InterfaceName>,
    member: Option<MemberName>,
    error_name: Option<ErrorName>,
    reply_serial: Option<Serial>,
    destination: Option<BusName>,
    sender: Option<BusName>,
    signature: Option<Signature>,
    unix_fds: Option<u32>,
}

fn read_header_fields(data: &[u8]) -> Result<ParsedFields, Error> {
    let mut fields = ParsedFields {
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: None,
        unix_fds: None,
    };
    if data.is_empty() {
        return Ok(fields);
    }

    let mut r = Reader::new(data, "a(yv)")?;
    r.begin_array()?;
    while r.next_array_entry()? {
        r.begin_struct()?;
        let code = r.read_byte()?;
        r.begin_variant()?;
        match code {
            c if c == HeaderFieldCode::Path as u8 => fields.path = Some(r.read_object_path()?),
            c if c == HeaderFieldCode::Interface as u8 => fields.interface = Some(r.read_string()?),
            c if c == HeaderFieldCode::Member as u8 => fields.member = Some(r.read_string()?),
            c if c == HeaderFieldCode::ErrorName as u8 => fields.error_name = Some(r.read_string()?),
            c if c == HeaderFieldCode::ReplySerial as u8 => {
                fields.reply_serial = Some(std::convert::TryFrom::try_from(r.read_u32()?)?)
            }
            c if c == HeaderFieldCode::Destination as u8 => fields.destination = Some(r.read_string()?),
            c if c == HeaderFieldCode::Sender as u8 => fields.sender = Some(r.read_string()?),
            c if c == HeaderFieldCode::Signature as u8 => fields.signature = Some(r.read_signature()?),
            c if c == HeaderFieldCode::UnixFds as u8 => fields.unix_fds = Some(r.read_u32()?),
            _ => return Err(Error::MalformedMessage("unknown header field code")),
        }
        r.end_variant()?;
        r.end_struct()?;
    }
    r.end_array()?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_method_call() {
        let msg = Message::method_call(
            ObjectPath::new("/org/example/Object").unwrap(),
            "Ping".to_string(),
        )
        .with_destination("org.example.Service".to_string())
        .with_serial(Serial(5));

        let bytes = msg.serialize().unwrap();
        let (parsed, consumed) = Message::deserialize(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.header.member.as_deref(), Some("Ping"));
        assert_eq!(parsed.header.serial, Serial(5));
        assert_eq!(
            parsed.header.destination.as_deref(),
            Some("org.example.Service")
        );
    }

    #[test]
    fn round_trips_body() {
        let mut w = Writer::new();
        w.write_string("hello").unwrap();
        w.write_i32(7).unwrap();
        let body = w.finish().unwrap();

        let msg = Message::method_call(ObjectPath::new("/a").unwrap(), "M".to_string())
            .with_body(body)
            .with_serial(Serial(1));
        let bytes = msg.serialize().unwrap();
        let (parsed, _) = Message::deserialize(&bytes).unwrap();
        let mut r = parsed.body_reader().unwrap();
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_i32().unwrap(), 7);
    }

    #[test]
    fn method_call_requires_member_and_path() {
        let mut header = Message::method_call(ObjectPath::new("/a").unwrap(), "M".to_string()).header;
        header.member = None;
        assert!(header.required_field_for_type().is_err());
    }

    #[test]
    fn rejects_oversized_declared_body() {
        let msg = Message::method_call(ObjectPath::new("/a").unwrap(), "M".to_string());
        let mut bytes = msg.serialize().unwrap();
        LittleEndian::write_u32(&mut bytes[4..8], MAX_MESSAGE_SIZE + 1);
        assert!(Message::deserialize(&bytes).is_err());
    }
}
