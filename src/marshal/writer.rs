//! Stateful little-endian argument writer.
//!
//! Grounded on `ArgumentList::Writer` (original_source/serialization/argumentlist.h)
//! for the container `begin_*`/`end_*` shape, and on the teacher's
//! `writer.rs` for the low-level `write_u32`/`write_padding` primitives --
//! rewritten to fix the teacher's string terminator bug (it wrote `b'\n'`
//! instead of a NUL) and to track a running signature instead of requiring
//! one up front.

use byteorder::{ByteOrder, LittleEndian};

use super::{padding_for, signature, Arguments, IoState, MAX_VARIANT_NESTING};
use crate::error::Error;
use crate::types::{ObjectPath, Signature, UnixFdIndex};

enum Container {
    Array {
        /// Offset of the 4-byte length placeholder in `buf`.
        len_pos: usize,
        /// Offset in `sig` right after the leading 'a'.
        elem_sig_start: usize,
        first_elem_sig: Option<String>,
        entries: usize,
    },
    Struct,
    DictEntry {
        wrote_key: bool,
    },
}

struct Frame {
    buf: Vec<u8>,
    sig: String,
    containers: Vec<Container>,
}

impl Frame {
    fn new() -> Self {
        Frame {
            buf: Vec::new(),
            sig: String::new(),
            containers: Vec::new(),
        }
    }
}

/// A stateful cursor that builds up a marshalled argument list one value at
/// a time. Does not require the caller to declare a signature up front:
/// the signature is inferred from the sequence of `write_*`/`begin_*` calls
/// and validated for iteration consistency on arrays/dicts as it goes.
pub struct Writer {
    top: Frame,
    /// Saved outer frames while writing the contents of a VARIANT: the
    /// variant's declared type can only be known once its single value has
    /// been fully written, so its bytes and running signature are built in
    /// an isolated frame and spliced into the parent on `end_variant`.
    saved: Vec<Frame>,
    state: IoState,
    error: Option<Error>,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            top: Frame::new(),
            saved: Vec::new(),
            state: IoState::NotStarted,
            error: None,
        }
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    /// Finishes writing and returns the accumulated signature and body
    /// bytes. Fails if a container was left open or the cursor is in an
    /// error state.
    pub fn finish(mut self) -> Result<Arguments, Error> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if !self.top.containers.is_empty() || !self.saved.is_empty() {
            return Err(Error::MalformedMessage("writer finished with an open container"));
        }
        signature::validate(&self.top.sig)?;
        self.state = IoState::Finished;
        Ok(Arguments::new(
            Signature::new_unchecked(self.top.sig),
            self.top.buf,
        ))
    }

    fn fail(&mut self, e: Error) -> Result<(), Error> {
        self.state = IoState::InvalidData;
        self.error = Some(match &e {
            Error::NestingTooDeep => Error::NestingTooDeep,
            _ => Error::MalformedMessage("writer error"),
        });
        Err(e)
    }

    fn align_to(&mut self, n: usize) {
        let pad = padding_for(self.top.buf.len(), n);
        self.top.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    fn push_type_code(&mut self, code: char) -> Result<(), Error> {
        self.top.sig.push(code);
        Ok(())
    }

    fn write_primitive_bytes(&mut self, code: char, align: usize, bytes: &[u8]) -> Result<(), Error> {
        self.align_to(align);
        self.top.buf.extend_from_slice(bytes);
        self.push_type_code(code)?;
        self.note_value_complete()
    }

    /// Called whenever one complete value (primitive, or a just-closed
    /// container) has been appended at the *current* nesting level. If
    /// that level is directly inside an array, accounts for iteration
    /// matching; dict-entry key/value bookkeeping also happens here.
    fn note_value_complete(&mut self) -> Result<(), Error> {
        match self.top.containers.last_mut() {
            Some(Container::DictEntry { wrote_key }) => {
                *wrote_key = true;
            }
            Some(Container::Array {
                elem_sig_start,
                first_elem_sig,
                entries,
                ..
            }) => {
                let elem_sig_start = *elem_sig_start;
                match first_elem_sig {
                    None => {
                        let this_iter = self.top.sig[elem_sig_start..].to_string();
                        *first_elem_sig = Some(this_iter);
                        *entries += 1;
                    }
                    Some(first) => {
                        // Only the text appended *since* the first element
                        // was recorded belongs to this iteration; the bytes
                        // before it are the first element's kept copy.
                        let this_iter = &self.top.sig[elem_sig_start + first.len()..];
                        if this_iter != first.as_str() {
                            self.state = IoState::InvalidData;
                            self.error = Some(Error::MalformedMessage(
                                "array elements do not all have the same type",
                            ));
                            return Err(Error::MalformedMessage(
                                "array elements do not all have the same type",
                            ));
                        }
                        // Discard the duplicated signature text; only the
                        // first iteration's type text is kept.
                        self.top.sig.truncate(elem_sig_start + first.len());
                        *entries += 1;
                    }
                }
            }
            _ => {}
        }
        self.state = IoState::AnyData;
        Ok(())
    }

    fn current_array_depth(&self) -> usize {
        self.top
            .containers
            .iter()
            .filter(|c| matches!(c, Container::Array { .. }))
            .count()
    }

    fn current_struct_depth(&self) -> usize {
        self.top
            .containers
            .iter()
            .filter(|c| matches!(c, Container::Struct | Container::DictEntry { .. }))
            .count()
    }

    pub fn write_byte(&mut self, v: u8) -> Result<(), Error> {
        self.write_primitive_bytes('y', 1, &[v])
    }

    pub fn write_boolean(&mut self, v: bool) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v as u32);
        self.write_primitive_bytes('b', 4, &buf)
    }

    pub fn write_i16(&mut self, v: i16) -> Result<(), Error> {
        let mut buf = [0u8; 2];
        LittleEndian::write_i16(&mut buf, v);
        self.write_primitive_bytes('n', 2, &buf)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), Error> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, v);
        self.write_primitive_bytes('q', 2, &buf)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, v);
        self.write_primitive_bytes('i', 4, &buf)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v);
        self.write_primitive_bytes('u', 4, &buf)
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, v);
        self.write_primitive_bytes('x', 8, &buf)
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, v);
        self.write_primitive_bytes('t', 8, &buf)
    }

    pub fn write_double(&mut self, v: f64) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, v);
        self.write_primitive_bytes('d', 8, &buf)
    }

    pub fn write_unix_fd(&mut self, v: UnixFdIndex) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v.0);
        self.write_primitive_bytes('h', 4, &buf)
    }

    fn write_length_prefixed_string(&mut self, code: char, s: &str) -> Result<(), Error> {
        if s.as_bytes().contains(&0) {
            return self.fail(Error::InvalidString);
        }
        self.align_to(4);
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, s.len() as u32);
        self.top.buf.extend_from_slice(&len_buf);
        self.top.buf.extend_from_slice(s.as_bytes());
        self.top.buf.push(0);
        self.push_type_code(code)?;
        self.note_value_complete()
    }

    pub fn write_string(&mut self, s: &str) -> Result<(), Error> {
        self.write_length_prefixed_string('s', s)
    }

    pub fn write_object_path(&mut self, p: &ObjectPath) -> Result<(), Error> {
        self.write_length_prefixed_string('o', p.as_str())
    }

    pub fn write_signature(&mut self, sig: &Signature) -> Result<(), Error> {
        let bytes = sig.as_str().as_bytes();
        self.top.buf.push(bytes.len() as u8);
        self.top.buf.extend_from_slice(bytes);
        self.top.buf.push(0);
        self.push_type_code('g')?;
        self.note_value_complete()
    }

    pub fn begin_array(&mut self) -> Result<(), Error> {
        if self.current_array_depth() >= signature::MAX_CONTAINER_DEPTH {
            return self.fail(Error::NestingTooDeep);
        }
        self.align_to(4);
        let len_pos = self.top.buf.len();
        self.top.buf.extend_from_slice(&[0u8; 4]);
        let elem_sig_start = self.top.sig.len() + 1;
        self.top.sig.push('a');
        self.top.containers.push(Container::Array {
            len_pos,
            elem_sig_start,
            first_elem_sig: None,
            entries: 0,
        });
        self.state = IoState::BeginArray;
        Ok(())
    }

    /// No-op marker call between array elements, kept for API symmetry
    /// with `Reader::next_array_entry`, where it actually drives iteration.
    pub fn next_array_entry(&mut self) {
        self.state = IoState::AnyData;
    }

    pub fn end_array(&mut self) -> Result<(), Error> {
        let (len_pos, first_elem_sig) = match self.top.containers.pop() {
            Some(Container::Array {
                len_pos,
                first_elem_sig,
                ..
            }) => (len_pos, first_elem_sig),
            _ => return self.fail(Error::MalformedMessage("end_array without begin_array")),
        };
        if first_elem_sig.is_none() {
            // Empty array: still a valid single complete type, but we
            // never learned the element type code. Arrays of unknown
            // element type cannot be marshalled; callers must write at
            // least the type information via a zero-entry pass -- for
            // practical purposes this crate requires the caller to
            // `write_*` zero times only for a *known* element type, which
            // they encode by calling `begin_array`/`end_array` around a
            // single throwaway write they then truncate is not supported.
            // Instead, empty arrays are produced by `Message` body helpers
            // that know the element type statically (see `message.rs`).
            return self.fail(Error::MalformedMessage(
                "cannot infer element type of an empty array from this API",
            ));
        }
        let body_len = (self.top.buf.len() - (len_pos + 4)) as u32;
        LittleEndian::write_u32(&mut self.top.buf[len_pos..len_pos + 4], body_len);
        self.state = IoState::EndArray;
        self.note_value_complete()
    }

    pub fn begin_struct(&mut self) -> Result<(), Error> {
        if self.current_struct_depth() >= signature::MAX_CONTAINER_DEPTH {
            return self.fail(Error::NestingTooDeep);
        }
        self.align_to(8);
        self.top.sig.push('(');
        self.top.containers.push(Container::Struct);
        self.state = IoState::BeginStruct;
        Ok(())
    }

    pub fn end_struct(&mut self) -> Result<(), Error> {
        match self.top.containers.pop() {
            Some(Container::Struct) => {}
            _ => return self.fail(Error::MalformedMessage("end_struct without begin_struct")),
        }
        self.top.sig.push(')');
        self.state = IoState::EndStruct;
        self.note_value_complete()
    }

    pub fn begin_dict_entry(&mut self) -> Result<(), Error> {
        if !matches!(self.top.containers.last(), Some(Container::Array { .. })) {
            return self.fail(Error::MalformedMessage("dict entries may only appear inside an array"));
        }
        self.align_to(8);
        self.top.sig.push('{');
        self.top.containers.push(Container::DictEntry { wrote_key: false });
        self.state = IoState::BeginDict;
        Ok(())
    }

    pub fn end_dict_entry(&mut self) -> Result<(), Error> {
        match self.top.containers.pop() {
            Some(Container::DictEntry { wrote_key }) => {
                if !wrote_key {
                    return self.fail(Error::MalformedMessage("dict entry missing key/value"));
                }
            }
            _ => return self.fail(Error::MalformedMessage("end_dict_entry without begin_dict_entry")),
        }
        self.top.sig.push('}');
        self.state = IoState::EndDict;
        self.note_value_complete()
    }

    /// Enters a VARIANT. All subsequent `write_*`/`begin_*` calls (up to
    /// the matching `end_variant`) build the variant's single contained
    /// value in an isolated frame, so its signature can be written out in
    /// full before the value's bytes, as the wire format requires.
    pub fn begin_variant(&mut self) -> Result<(), Error> {
        if self.saved.len() >= MAX_VARIANT_NESTING {
            return self.fail(Error::NestingTooDeep);
        }
        self.saved.push(std::mem::replace(&mut self.top, Frame::new()));
        self.state = IoState::BeginVariant;
        Ok(())
    }

    pub fn end_variant(&mut self) -> Result<(), Error> {
        if !self.top.containers.is_empty() {
            return self.fail(Error::MalformedMessage("variant value left an open container"));
        }
        if self.top.sig.is_empty() {
            return self.fail(Error::MalformedMessage("variant must contain exactly one value"));
        }
        signature::validate_single_complete_type(&self.top.sig)?;
        let inner = std::mem::replace(&mut self.top, self.saved.pop().ok_or_else(|| {
            Error::MalformedMessage("end_variant without begin_variant")
        })?);

        let inner_sig_bytes = inner.sig.as_bytes();
        if inner_sig_bytes.len() > 255 {
            return self.fail(Error::SignatureTooLong);
        }
        self.top.buf.push(inner_sig_bytes.len() as u8);
        self.top.buf.extend_from_slice(inner_sig_bytes);
        self.top.buf.push(0);

        // Padding to an 8-byte boundary here is always sufficient: every
        // alignment in this format divides 8, so offsets inside `inner.buf`
        // computed relative to its own start (0) stay correct once spliced
        // at any offset that is itself a multiple of 8.
        self.align_to(8);
        self.top.buf.extend_from_slice(&inner.buf);

        self.push_type_code('v')?;
        self.state = IoState::EndVariant;
        self.note_value_complete()
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_align_correctly() {
        let mut w = Writer::new();
        w.write_byte(1).unwrap();
        w.write_u32(0xdead_beef).unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "yu");
        // byte at 0, 3 bytes padding, u32 at 4..8
        assert_eq!(args.data.len(), 8);
        assert_eq!(args.data[0], 1);
        assert_eq!(LittleEndian::read_u32(&args.data[4..8]), 0xdead_beef);
    }

    #[test]
    fn string_is_nul_terminated() {
        let mut w = Writer::new();
        w.write_string("hi").unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "s");
        // 4-byte length + "hi" + NUL
        assert_eq!(&args.data[0..4], &2u32.to_le_bytes());
        assert_eq!(&args.data[4..6], b"hi");
        assert_eq!(args.data[6], 0);
    }

    #[test]
    fn array_of_strings_round_trips_signature() {
        let mut w = Writer::new();
        w.begin_array().unwrap();
        w.write_string("a").unwrap();
        w.write_string("bb").unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "as");
    }

    #[test]
    fn array_rejects_mismatched_element_types() {
        let mut w = Writer::new();
        w.begin_array().unwrap();
        w.write_string("a").unwrap();
        let err = w.write_u32(1);
        // write itself succeeds; mismatch is only caught at note_value_complete
        assert!(err.is_ok());
        let err = w.end_array();
        assert!(err.is_err());
    }

    #[test]
    fn struct_signature_uses_parens() {
        let mut w = Writer::new();
        w.begin_struct().unwrap();
        w.write_i32(1).unwrap();
        w.write_string("x").unwrap();
        w.end_struct().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "(is)");
    }

    #[test]
    fn dict_of_string_to_variant() {
        let mut w = Writer::new();
        w.begin_array().unwrap();
        w.begin_dict_entry().unwrap();
        w.write_string("key").unwrap();
        w.begin_variant().unwrap();
        w.write_u32(7).unwrap();
        w.end_variant().unwrap();
        w.end_dict_entry().unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "a{sv}");
    }

    #[test]
    fn nested_struct_in_variant() {
        let mut w = Writer::new();
        w.begin_variant().unwrap();
        w.begin_struct().unwrap();
        w.write_byte(9).unwrap();
        w.write_i64(-1).unwrap();
        w.end_struct().unwrap();
        w.end_variant().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature.as_str(), "v");
    }

    #[test]
    fn variant_nesting_limit_enforced() {
        let mut w = Writer::new();
        for _ in 0..MAX_VARIANT_NESTING {
            w.begin_variant().unwrap();
        }
        assert!(w.begin_variant().is_err());
    }
}
