//! Property-based checks for the marshaller and the wire types it leans
//! on, run against the public API only.

use std::convert::TryFrom;

use quickcheck_macros::quickcheck;

use busway::{Reader, Serial, Signature, Writer};

#[quickcheck]
fn u32_round_trips(v: u32) -> bool {
    let mut w = Writer::new();
    w.write_u32(v).unwrap();
    let args = w.finish().unwrap();
    let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
    r.read_u32().unwrap() == v
}

#[quickcheck]
fn i64_round_trips(v: i64) -> bool {
    let mut w = Writer::new();
    w.write_i64(v).unwrap();
    let args = w.finish().unwrap();
    let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
    r.read_i64().unwrap() == v
}

#[quickcheck]
fn string_round_trips(v: String) -> bool {
    if v.contains('\0') {
        return true; // not a representable D-Bus STRING, nothing to check
    }
    let mut w = Writer::new();
    w.write_string(&v).unwrap();
    let args = w.finish().unwrap();
    let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
    r.read_string().unwrap() == v
}

#[quickcheck]
fn array_of_u32_round_trips(values: Vec<u32>) -> bool {
    let mut w = Writer::new();
    w.begin_array().unwrap();
    for v in &values {
        w.next_array_entry().unwrap();
        w.write_u32(*v).unwrap();
    }
    w.end_array().unwrap();
    let args = w.finish().unwrap();

    let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
    r.begin_array().unwrap();
    let mut out = Vec::new();
    while r.next_array_entry().unwrap() {
        out.push(r.read_u32().unwrap());
    }
    r.end_array().unwrap();
    out == values
}

#[quickcheck]
fn nested_struct_round_trips(a: i32, b: String) -> bool {
    if b.contains('\0') {
        return true;
    }
    let mut w = Writer::new();
    w.begin_struct().unwrap();
    w.write_i32(a).unwrap();
    w.write_string(&b).unwrap();
    w.end_struct().unwrap();
    let args = w.finish().unwrap();

    let mut r = Reader::new(&args.data, args.signature.as_str()).unwrap();
    r.begin_struct().unwrap();
    let got_a = r.read_i32().unwrap();
    let got_b = r.read_string().unwrap();
    r.end_struct().unwrap();
    got_a == a && got_b == b
}

/// Nesting exactly at the 32-deep array limit is accepted; one level past
/// it is rejected, regardless of which element type closes the chain.
#[quickcheck]
fn array_nesting_boundary_is_respected(extra: u8) -> bool {
    let extra = (extra % 4) as usize; // keep generated depths small
    let sig_ok: String = "a".repeat(32) + "y";
    let sig_over: String = "a".repeat(32 + 1 + extra) + "y";
    Signature::new(sig_ok).is_ok() && Signature::new(sig_over).is_err()
}

/// Every serial built through the public, validating constructor is
/// non-zero, and distinct inputs never collapse to the same serial.
#[quickcheck]
fn serial_try_from_rejects_only_zero(v: u32) -> bool {
    match Serial::try_from(v) {
        Ok(s) => v != 0 && s.0 == v,
        Err(_) => v == 0,
    }
}
