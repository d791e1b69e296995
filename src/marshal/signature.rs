//! Signature grammar validation: recursive descent over the
//! single-complete-type grammar described in §4.1 of the spec.
//!
//! Grounded on `ArgumentList::isSignatureValid` (original_source/serialization/argumentlist.h),
//! re-expressed as a small recursive-descent parser instead of the teacher's
//! ad hoc `ToTypeCode` string concatenation, since the teacher never
//! actually validates signatures it is merely able to produce them.

use crate::error::Error;

/// Maximum nesting depth for both array ('a' prefixes) and struct
/// parentheses, counted separately, per §4.1/§8.
pub const MAX_CONTAINER_DEPTH: usize = 32;

/// A signature longer than this (in bytes) cannot be marshalled: the wire
/// format's signature length prefix is a single byte.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Validates that `sig` is a sequence of zero or more complete types,
/// suitable for a message body or header field signature.
pub fn validate(sig: &str) -> Result<(), Error> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(Error::SignatureTooLong);
    }
    let bytes = sig.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        pos = parse_complete_type(bytes, pos, 0, 0, false)?;
    }
    Ok(())
}

/// Validates that `sig` is exactly one single complete type (used for the
/// signature embedded in a VARIANT).
pub fn validate_single_complete_type(sig: &str) -> Result<(), Error> {
    if sig.is_empty() {
        return Err(Error::MalformedMessage("variant signature must not be empty"));
    }
    let bytes = sig.as_bytes();
    let end = parse_complete_type(bytes, 0, 0, 0, false)?;
    if end != bytes.len() {
        return Err(Error::MalformedMessage(
            "variant signature must contain exactly one complete type",
        ));
    }
    Ok(())
}

/// Returns the end position of the single complete type starting at `pos`
/// in an already-validated signature. Used by `Reader::begin_array` to
/// slice out an array's element-type text without re-checking nesting
/// depth; this is also the one position in a signature where a bare
/// dict-entry `{...}` is allowed to stand alone, since it's always reached
/// right after an `a`.
pub(crate) fn complete_type_end(bytes: &[u8], pos: usize) -> Result<usize, Error> {
    parse_complete_type(bytes, pos, 0, 0, true)
}

/// Parses one complete type starting at `pos`, returning the position just
/// past it. `array_depth`/`struct_depth` track nesting for the 32/32 limit.
/// `allow_dict_entry` is true only when parsing an array's element type
/// directly (the `b'a'` arm below): a dict-entry `{...}` is not a complete
/// type on its own anywhere else, per the grammar.
fn parse_complete_type(
    bytes: &[u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
    allow_dict_entry: bool,
) -> Result<usize, Error> {
    if pos >= bytes.len() {
        return Err(Error::MalformedMessage("truncated signature"));
    }
    match bytes[pos] {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' => Ok(pos + 1),
        b'v' => Ok(pos + 1),
        b'a' => {
            if array_depth >= MAX_CONTAINER_DEPTH {
                return Err(Error::NestingTooDeep);
            }
            parse_complete_type(bytes, pos + 1, array_depth + 1, struct_depth, true)
        }
        b'(' => {
            if struct_depth >= MAX_CONTAINER_DEPTH {
                return Err(Error::NestingTooDeep);
            }
            let mut p = pos + 1;
            if p < bytes.len() && bytes[p] == b')' {
                return Err(Error::MalformedMessage("empty struct signature"));
            }
            while p < bytes.len() && bytes[p] != b')' {
                p = parse_complete_type(bytes, p, array_depth, struct_depth + 1, false)?;
            }
            if p >= bytes.len() {
                return Err(Error::MalformedMessage("unterminated struct signature"));
            }
            Ok(p + 1)
        }
        b'{' if allow_dict_entry => {
            // Only valid directly as the element type of an array; parse
            // the entry's shape here: exactly one basic-type key followed
            // by exactly one complete-type value.
            if struct_depth >= MAX_CONTAINER_DEPTH {
                return Err(Error::NestingTooDeep);
            }
            let key_start = pos + 1;
            if key_start >= bytes.len() || !is_basic_type_code(bytes[key_start]) {
                return Err(Error::MalformedMessage("dict entry key must be a basic type"));
            }
            let key_end = key_start + 1;
            let value_end = parse_complete_type(bytes, key_end, array_depth, struct_depth + 1, false)?;
            if value_end >= bytes.len() || bytes[value_end] != b'}' {
                return Err(Error::MalformedMessage("unterminated dict entry signature"));
            }
            Ok(value_end + 1)
        }
        _ => Err(Error::MalformedMessage("unknown type code in signature")),
    }
}

fn is_basic_type_code(b: u8) -> bool {
    matches!(
        b,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Validates that a string is non-empty... actually D-Bus STRINGs may be
/// empty; the only requirement is valid UTF-8 with no embedded NUL, which
/// is already guaranteed by Rust's `str`. Kept as a named entry point so
/// call sites read naturally; see `is_object_path_valid` in `crate::types`
/// for object paths, which have a real grammar.
pub fn is_string_valid(_s: &str) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_basic_types() {
        for c in ["y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "h", "v"] {
            assert!(validate(c).is_ok(), "{c} should validate");
        }
    }

    #[test]
    fn accepts_containers() {
        assert!(validate("as").is_ok());
        assert!(validate("a{sv}").is_ok());
        assert!(validate("(ii)").is_ok());
        assert!(validate("a(ii)").is_ok());
        assert!(validate("").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(validate("(").is_err());
        assert!(validate("()").is_err());
        assert!(validate("{sv}").is_err()); // dict entry outside array context is still structurally parseable but callers should use 'a{sv}'
        assert!(validate("a{vs}").is_err()); // variant key not allowed
        assert!(validate("z").is_err());
    }

    #[test]
    fn rejects_nesting_too_deep() {
        let deep_array: String = "a".repeat(33) + "y";
        assert!(matches!(validate(&deep_array), Err(Error::NestingTooDeep)));

        let ok_array: String = "a".repeat(32) + "y";
        assert!(validate(&ok_array).is_ok());

        let deep_struct: String = "(".repeat(33) + "y" + &")".repeat(33);
        assert!(matches!(validate(&deep_struct), Err(Error::NestingTooDeep)));

        let ok_struct: String = "(".repeat(32) + "y" + &")".repeat(32);
        assert!(validate(&ok_struct).is_ok());
    }
}
