//! Bus addresses: parsing the `unix:path=...;tcp:host=...,port=...` syntax
//! and discovering the session/system bus the way the reference client
//! library does.
//!
//! Grounded on `address.rs` of the teacher crate for the `ServerAddress`
//! formatting shape, generalized here into a parser as well (the teacher
//! could only produce address strings, never consume them), and on
//! `original_source/connection/connectaddress.cpp` for bus discovery
//! (`DBUS_SESSION_BUS_ADDRESS`, the systemd user-bus fallback, and
//! `DBUS_SYSTEM_BUS_ADDRESS`/the well-known system socket path).

use std::env;
use std::path::PathBuf;

use crate::error::Error;

pub const WELL_KNOWN_SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const WELL_KNOWN_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// One parsed entry of a (possibly `;`-separated) address string. A client
/// tries each entry in order until one connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectAddress {
    Unix {
        path: PathBuf,
    },
    /// A Linux abstract-namespace socket (no filesystem entry, name has a
    /// leading NUL on the wire).
    UnixAbstract {
        name: String,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl ConnectAddress {
    pub fn to_address_string(&self) -> String {
        match self {
            ConnectAddress::Unix { path } => format!("unix:path={}", path.display()),
            ConnectAddress::UnixAbstract { name } => format!("unix:abstract={}", name),
            ConnectAddress::Tcp { host, port } => format!("tcp:host={host},port={port}"),
        }
    }
}

/// Parses a `;`-separated list of `transport:key=value,key=value` entries,
/// per the D-Bus address syntax.
pub fn parse(address: &str) -> Result<Vec<ConnectAddress>, Error> {
    address
        .split(';')
        .filter(|s| !s.is_empty())
        .map(parse_one)
        .collect()
}

fn parse_one(entry: &str) -> Result<ConnectAddress, Error> {
    let (transport, rest) = entry
        .split_once(':')
        .ok_or_else(|| Error::InvalidAddress(entry.to_string()))?;

    let pairs: Vec<(&str, String)> = rest
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|kv| {
            let (k, v) = kv.split_once('=').ok_or_else(|| Error::InvalidAddress(entry.to_string()))?;
            Ok((k, percent_decode(v)))
        })
        .collect::<Result<_, Error>>()?;

    let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone());

    match transport {
        "unix" => {
            if let Some(path) = get("path") {
                Ok(ConnectAddress::Unix { path: PathBuf::from(path) })
            } else if let Some(name) = get("abstract") {
                Ok(ConnectAddress::UnixAbstract { name })
            } else {
                Err(Error::InvalidAddress(entry.to_string()))
            }
        }
        "tcp" => {
            let host = get("host").unwrap_or_else(|| "localhost".to_string());
            let port = get("port")
                .ok_or_else(|| Error::InvalidAddress(entry.to_string()))?
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddress(entry.to_string()))?;
            Ok(ConnectAddress::Tcp { host, port })
        }
        _ => Err(Error::InvalidAddress(entry.to_string())),
    }
}

/// D-Bus addresses percent-encode any byte outside an allow-list; we only
/// need to decode `%XX` escapes for the values we care about (paths,
/// hostnames).
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Bus discovery, mirroring the reference client's fallback chain.
pub mod discovery {
    use super::*;

    /// Resolves the session bus address: `DBUS_SESSION_BUS_ADDRESS` if
    /// set, else the systemd-managed per-user socket at
    /// `$XDG_RUNTIME_DIR/bus` (or `/run/user/<uid>/bus`) that modern Linux
    /// systems start automatically alongside the user's login session.
    pub fn session_bus_address() -> Result<Vec<ConnectAddress>, Error> {
        if let Ok(addr) = env::var(SESSION_BUS_ENV) {
            return parse(&addr);
        }
        let runtime_dir = env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("/run/user/{}", current_uid())));
        Ok(vec![ConnectAddress::Unix {
            path: runtime_dir.join("bus"),
        }])
    }

    /// Resolves the system bus address: `DBUS_SYSTEM_BUS_ADDRESS` if set,
    /// else the well-known socket path.
    pub fn system_bus_address() -> Result<Vec<ConnectAddress>, Error> {
        let addr = env::var(WELL_KNOWN_SYSTEM_BUS_ENV)
            .unwrap_or_else(|_| WELL_KNOWN_SYSTEM_BUS_ADDRESS.to_string());
        parse(&addr)
    }

    fn current_uid() -> u32 {
        nix::unistd::getuid().as_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let addrs = parse("unix:path=/run/dbus/system_bus_socket").unwrap();
        assert_eq!(
            addrs[0],
            ConnectAddress::Unix {
                path: PathBuf::from("/run/dbus/system_bus_socket")
            }
        );
    }

    #[test]
    fn parses_unix_abstract() {
        let addrs = parse("unix:abstract=/tmp/dbus-xyz").unwrap();
        assert_eq!(
            addrs[0],
            ConnectAddress::UnixAbstract {
                name: "/tmp/dbus-xyz".to_string()
            }
        );
    }

    #[test]
    fn parses_tcp() {
        let addrs = parse("tcp:host=127.0.0.1,port=1234").unwrap();
        assert_eq!(
            addrs[0],
            ConnectAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: 1234
            }
        );
    }

    #[test]
    fn parses_multiple_entries() {
        let addrs = parse("unix:path=/a;tcp:host=h,port=1").unwrap();
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse("unix:").is_err());
        assert!(parse("bogus:stuff=1").is_err());
    }

    #[test]
    fn decodes_percent_escapes() {
        let addrs = parse("unix:path=/tmp/has%20space").unwrap();
        assert_eq!(
            addrs[0],
            ConnectAddress::Unix {
                path: PathBuf::from("/tmp/has space")
            }
        );
    }
}
