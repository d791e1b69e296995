//! Stateful little-endian argument reader, the inverse of `Writer`.
//!
//! Grounded on `ArgumentList::Reader` (original_source/serialization/argumentlist.h):
//! unlike `Writer`, a `Reader` is constructed with the full signature
//! already known (it travels in the message header), so container shapes
//! don't need to be inferred -- `begin_array`/`next_array_entry`/`end_array`
//! drive iteration the same way the original's Reader does.

use byteorder::{ByteOrder, LittleEndian};

use super::{padding_for, signature, IoState, MAX_VARIANT_NESTING};
use crate::error::Error;
use crate::types::{ObjectPath, Signature, UnixFdIndex};

enum ContainerCtx {
    Array {
        end_pos: usize,
        elem_sig_start: usize,
        elem_sig_end: usize,
    },
    Struct,
    DictEntry,
}

struct SigCtx {
    bytes: Vec<u8>,
    pos: usize,
}

/// A cursor over a byte slice plus the signature describing its contents.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    sig: SigCtx,
    saved_sigs: Vec<SigCtx>,
    containers: Vec<ContainerCtx>,
    state: IoState,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], signature: &str) -> Result<Self, Error> {
        signature::validate(signature)?;
        Ok(Reader {
            data,
            pos: 0,
            sig: SigCtx {
                bytes: signature.as_bytes().to_vec(),
                pos: 0,
            },
            saved_sigs: Vec::new(),
            containers: Vec::new(),
            state: IoState::NotStarted,
        })
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    /// True once every type in the top-level signature has been consumed
    /// and no container is left open.
    pub fn is_finished(&self) -> bool {
        self.saved_sigs.is_empty() && self.containers.is_empty() && self.sig.pos >= self.sig.bytes.len()
    }

    fn peek_code(&self) -> Result<u8, Error> {
        self.sig
            .bytes
            .get(self.sig.pos)
            .copied()
            .ok_or(Error::MalformedMessage("no more values in signature"))
    }

    fn expect_code(&mut self, expected: u8) -> Result<(), Error> {
        let got = self.peek_code()?;
        if got != expected {
            self.state = IoState::InvalidData;
            return Err(Error::MalformedMessage("argument type does not match signature"));
        }
        self.sig.pos += 1;
        Ok(())
    }

    fn align_to(&mut self, n: usize) -> Result<(), Error> {
        let pad = padding_for(self.pos, n);
        if self.pos + pad > self.data.len() {
            return Err(Error::MalformedMessage("truncated argument data (padding)"));
        }
        self.pos += pad;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            self.state = IoState::InvalidData;
            return Err(Error::MalformedMessage("truncated argument data"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn after_value(&mut self) {
        self.state = IoState::AnyData;
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        self.expect_code(b'y')?;
        self.align_to(1)?;
        let v = self.take(1)?[0];
        self.after_value();
        Ok(v)
    }

    pub fn read_boolean(&mut self) -> Result<bool, Error> {
        self.expect_code(b'b')?;
        self.align_to(4)?;
        let v = LittleEndian::read_u32(self.take(4)?);
        self.after_value();
        Ok(v != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        self.expect_code(b'n')?;
        self.align_to(2)?;
        let v = LittleEndian::read_i16(self.take(2)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        self.expect_code(b'q')?;
        self.align_to(2)?;
        let v = LittleEndian::read_u16(self.take(2)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        self.expect_code(b'i')?;
        self.align_to(4)?;
        let v = LittleEndian::read_i32(self.take(4)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        self.expect_code(b'u')?;
        self.align_to(4)?;
        let v = LittleEndian::read_u32(self.take(4)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        self.expect_code(b'x')?;
        self.align_to(8)?;
        let v = LittleEndian::read_i64(self.take(8)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        self.expect_code(b't')?;
        self.align_to(8)?;
        let v = LittleEndian::read_u64(self.take(8)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_double(&mut self) -> Result<f64, Error> {
        self.expect_code(b'd')?;
        self.align_to(8)?;
        let v = LittleEndian::read_f64(self.take(8)?);
        self.after_value();
        Ok(v)
    }

    pub fn read_unix_fd(&mut self) -> Result<UnixFdIndex, Error> {
        self.expect_code(b'h')?;
        self.align_to(4)?;
        let v = LittleEndian::read_u32(self.take(4)?);
        self.after_value();
        Ok(UnixFdIndex(v))
    }

    fn read_length_prefixed_string(&mut self) -> Result<String, Error> {
        self.align_to(4)?;
        let len = LittleEndian::read_u32(self.take(4)?) as usize;
        let bytes = self.take(len)?;
        let nul = self.take(1)?;
        if nul != [0] {
            return Err(Error::MalformedMessage("string not NUL terminated"));
        }
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedMessage("string is not valid UTF-8"))?
            .to_string();
        Ok(s)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        self.expect_code(b's')?;
        let s = self.read_length_prefixed_string()?;
        self.after_value();
        Ok(s)
    }

    pub fn read_object_path(&mut self) -> Result<ObjectPath, Error> {
        self.expect_code(b'o')?;
        let s = self.read_length_prefixed_string()?;
        self.after_value();
        ObjectPath::new(s)
    }

    pub fn read_signature(&mut self) -> Result<Signature, Error> {
        self.expect_code(b'g')?;
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        let nul = self.take(1)?;
        if nul != [0] {
            return Err(Error::MalformedMessage("signature not NUL terminated"));
        }
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedMessage("signature is not valid UTF-8"))?;
        self.after_value();
        Signature::new(s)
    }

    pub fn begin_array(&mut self) -> Result<(), Error> {
        self.expect_code(b'a')?;
        let elem_sig_start = self.sig.pos;
        let elem_sig_end = signature::complete_type_end(&self.sig.bytes, elem_sig_start)?;
        let elem_align = super::align_of_type_code(self.sig.bytes[elem_sig_start]);

        self.align_to(4)?;
        let byte_len = LittleEndian::read_u32(self.take(4)?) as usize;
        self.align_to(elem_align)?;
        let end_pos = self.pos + byte_len;
        if end_pos > self.data.len() {
            return Err(Error::MalformedMessage("array length exceeds remaining data"));
        }
        self.containers.push(ContainerCtx::Array {
            end_pos,
            elem_sig_start,
            elem_sig_end,
        });
        self.state = IoState::BeginArray;
        Ok(())
    }

    /// Returns `true` if there is another element to read (in which case
    /// the signature cursor is rewound to the element's type so the next
    /// `read_*`/`begin_*` call reads it), or `false` once the array is
    /// exhausted, at which point the caller should call `end_array`.
    pub fn next_array_entry(&mut self) -> Result<bool, Error> {
        match self.containers.last() {
            Some(ContainerCtx::Array {
                end_pos,
                elem_sig_start,
                ..
            }) => {
                if self.pos >= *end_pos {
                    self.state = IoState::EndArray;
                    Ok(false)
                } else {
                    self.sig.pos = *elem_sig_start;
                    self.state = IoState::NextArrayEntry;
                    Ok(true)
                }
            }
            _ => Err(Error::MalformedMessage("next_array_entry outside an array")),
        }
    }

    pub fn end_array(&mut self) -> Result<(), Error> {
        match self.containers.pop() {
            Some(ContainerCtx::Array {
                end_pos,
                elem_sig_end,
                ..
            }) => {
                if self.pos != end_pos {
                    return Err(Error::MalformedMessage("array body not fully consumed"));
                }
                self.sig.pos = elem_sig_end;
                self.after_value();
                Ok(())
            }
            _ => Err(Error::MalformedMessage("end_array without begin_array")),
        }
    }

    pub fn begin_struct(&mut self) -> Result<(), Error> {
        self.expect_code(b'(')?;
        self.align_to(8)?;
        self.containers.push(ContainerCtx::Struct);
        self.state = IoState::BeginStruct;
        Ok(())
    }

    pub fn end_struct(&mut self) -> Result<(), Error> {
        match self.containers.pop() {
            Some(ContainerCtx::Struct) => {}
            _ => return Err(Error::MalformedMessage("end_struct without begin_struct")),
        }
        self.expect_code(b')')?;
        self.after_value();
        Ok(())
    }

    pub fn begin_dict_entry(&mut self) -> Result<(), Error> {
        self.expect_code(b'{')?;
        self.align_to(8)?;
        self.containers.push(ContainerCtx::DictEntry);
        self.state = IoState::BeginDict;
        Ok(())
    }

    pub fn end_dict_entry(&mut self) -> Result<(), Error> {
        match self.containers.pop() {
            Some(ContainerCtx::DictEntry) => {}
            _ => return Err(Error::MalformedMessage("end_dict_entry without begin_dict_entry")),
        }
        self.expect_code(b'}')?;
        self.after_value();
        Ok(())
    }

    pub fn begin_variant(&mut self) -> Result<(), Error> {
        if self.saved_sigs.len() >= MAX_VARIANT_NESTING {
            return Err(Error::NestingTooDeep);
        }
        self.expect_code(b'v')?;
        let len = self.take(1)?[0] as usize;
        let sig_bytes = self.take(len)?.to_vec();
        let nul = self.take(1)?;
        if nul != [0] {
            return Err(Error::MalformedMessage("variant signature not NUL terminated"));
        }
        let inner_sig = std::str::from_utf8(&sig_bytes)
            .map_err(|_| Error::MalformedMessage("variant signature is not valid UTF-8"))?;
        signature::validate_single_complete_type(inner_sig)?;

        self.saved_sigs.push(std::mem::replace(
            &mut self.sig,
            SigCtx {
                bytes: sig_bytes,
                pos: 0,
            },
        ));
        self.state = IoState::BeginVariant;
        Ok(())
    }

    pub fn end_variant(&mut self) -> Result<(), Error> {
        if self.sig.pos != self.sig.bytes.len() {
            return Err(Error::MalformedMessage("variant value not fully consumed"));
        }
        self.sig = self
            .saved_sigs
            .pop()
            .ok_or(Error::MalformedMessage("end_variant without begin_variant"))?;
        self.after_value();
        Ok(())
    }

    /// The type code of the value the next `read_*`/`begin_*` call would
    /// consume, or `None` at the end of the current signature.
    pub fn peek_type_code(&self) -> Option<u8> {
        self.sig.bytes.get(self.sig.pos).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Writer;
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut w = Writer::new();
        w.write_byte(42).unwrap();
        w.write_string("hello").unwrap();
        w.write_i64(-9000).unwrap();
        let args = w.finish().unwrap();

        let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
        assert_eq!(r.read_byte().unwrap(), 42);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_i64().unwrap(), -9000);
        assert!(r.is_finished());
    }

    #[test]
    fn round_trips_array() {
        let mut w = Writer::new();
        w.begin_array().unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(2).unwrap();
        w.write_u32(3).unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();

        let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
        r.begin_array().unwrap();
        let mut values = Vec::new();
        while r.next_array_entry().unwrap() {
            values.push(r.read_u32().unwrap());
        }
        r.end_array().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(r.is_finished());
    }

    #[test]
    fn round_trips_dict_and_variant() {
        let mut w = Writer::new();
        w.begin_array().unwrap();
        w.begin_dict_entry().unwrap();
        w.write_string("answer").unwrap();
        w.begin_variant().unwrap();
        w.write_i32(42).unwrap();
        w.end_variant().unwrap();
        w.end_dict_entry().unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();

        let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
        r.begin_array().unwrap();
        assert!(r.next_array_entry().unwrap());
        r.begin_dict_entry().unwrap();
        assert_eq!(r.read_string().unwrap(), "answer");
        r.begin_variant().unwrap();
        assert_eq!(r.read_i32().unwrap(), 42);
        r.end_variant().unwrap();
        r.end_dict_entry().unwrap();
        assert!(!r.next_array_entry().unwrap());
        r.end_array().unwrap();
        assert!(r.is_finished());
    }

    #[test]
    fn rejects_type_mismatch() {
        let mut w = Writer::new();
        w.write_u32(1).unwrap();
        let args = w.finish().unwrap();
        let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
        assert!(r.read_i64().is_err());
    }
}
