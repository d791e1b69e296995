//! Basic D-Bus types shared by the marshaller, message headers and the
//! connection layer.
//!
//! Grounded on `type_system.rs` of the teacher crate; extended with the
//! `Serial` non-zero invariant and object-path validation that the
//! teacher left as TODOs.

use std::convert::TryFrom;
use std::fmt;

use crate::error::Error;

/// The serial of a message. Used as a cookie by the sender to identify the
/// reply corresponding to a request; must never be zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(pub u32);

impl Serial {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Serial {
    type Error = Error;

    fn try_from(s: u32) -> Result<Serial, Error> {
        if s == 0 {
            return Err(Error::MalformedMessage("serial must not be zero"));
        }
        Ok(Serial(s))
    }
}

/// A name used to refer to an object instance, e.g. `/org/freedesktop/DBus`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates and wraps a path string.
    ///
    /// Must be non-empty, start with `/`, contain no double slashes, no
    /// trailing slash unless the path is exactly "/", and each element
    /// must match `[A-Za-z0-9_]+`.
    pub fn new(path: impl Into<String>) -> Result<ObjectPath, Error> {
        let path = path.into();
        if is_object_path_valid(&path) {
            Ok(ObjectPath(path))
        } else {
            Err(Error::InvalidObjectPath(path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_object_path_valid(path: &str) -> bool {
    if path.is_empty() || !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    if path.ends_with('/') {
        return false;
    }
    path[1..].split('/').all(|elem| {
        !elem.is_empty() && elem.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// A type signature string; the same as a D-Bus `STRING` except the length
/// prefix is a single byte, so the maximum length is 255.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Signature(String);

impl Signature {
    pub fn new(s: impl Into<String>) -> Result<Signature, Error> {
        let s = s.into();
        if s.len() > 255 {
            return Err(Error::SignatureTooLong);
        }
        crate::marshal::signature::validate(&s)?;
        Ok(Signature(s))
    }

    /// Constructs a signature without grammar validation. Used internally
    /// once a signature has already been validated by the grammar parser,
    /// to avoid double work.
    pub(crate) fn new_unchecked(s: impl Into<String>) -> Signature {
        Signature(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A borrowed unix file descriptor index into a `Message`'s attached-fd
/// list (the wire representation of `UnixFd` is the index, not the raw
/// number -- the raw fd travels out-of-band as ancillary data).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnixFdIndex(pub u32);

pub trait BasicType {}

impl BasicType for u8 {}
impl BasicType for bool {}
impl BasicType for i16 {}
impl BasicType for u16 {}
impl BasicType for i32 {}
impl BasicType for u32 {}
impl BasicType for i64 {}
impl BasicType for u64 {}
impl BasicType for f64 {}
impl BasicType for UnixFdIndex {}
impl BasicType for String {}
impl BasicType for ObjectPath {}
impl BasicType for Signature {}

/// A bus or unique connection name, e.g. `org.freedesktop.DBus` or `:1.42`.
pub type BusName = String;
pub type InterfaceName = String;
pub type MemberName = String;
pub type ErrorName = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_validity() {
        assert!(is_object_path_valid("/"));
        assert!(is_object_path_valid("/org/freedesktop/DBus"));
        assert!(!is_object_path_valid(""));
        assert!(!is_object_path_valid("no/leading/slash"));
        assert!(!is_object_path_valid("/trailing/"));
        assert!(!is_object_path_valid("/double//slash"));
        assert!(!is_object_path_valid("/bad-char!"));
    }

    #[test]
    fn serial_rejects_zero() {
        assert!(Serial::try_from(0).is_err());
        assert!(Serial::try_from(1).is_ok());
    }
}
