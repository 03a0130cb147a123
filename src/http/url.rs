use std::fmt;

use bytes::Bytes;

use crate::error::ProxyError;

/// A request-target parsed with proxy heuristics.
///
/// A forward proxy sees three shapes of target on the wire:
/// origin-form (`/get?key=value`) for web-server requests, authority-form
/// (`httpbin.org:443`) for `CONNECT` tunnels, and absolute-form
/// (`http://httpbin.org/get`) for plain proxy requests. General-purpose URL
/// crates reject or normalise these shapes, so the classifier is hand-rolled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub scheme: Option<Bytes>,
    pub hostname: Option<Bytes>,
    pub port: Option<u16>,
    /// Path + query + fragment; starts with `/` when present.
    pub remainder: Option<Bytes>,
}

impl Url {
    /// Classify raw request-target bytes. Rules, in order:
    ///
    /// 1. Leading `/` — origin-form; the whole target is the remainder.
    /// 2. `http://` or `https://` prefix — absolute-form; authority up to the
    ///    first `/`, the rest (slash included) is the remainder.
    /// 3. Anything else — authority-form, host and optional port only.
    pub fn from_bytes(raw: &[u8]) -> Result<Url, ProxyError> {
        if raw.is_empty() {
            return Err(ProxyError::MalformedRequestTarget(
                "empty request target".into(),
            ));
        }
        if raw[0] == b'/' {
            return Ok(Url {
                remainder: Some(Bytes::copy_from_slice(raw)),
                ..Url::default()
            });
        }
        let (scheme, rest): (Option<&'static [u8]>, &[u8]) =
            if let Some(rest) = raw.strip_prefix(b"http://") {
                (Some(b"http"), rest)
            } else if let Some(rest) = raw.strip_prefix(b"https://") {
                (Some(b"https"), rest)
            } else {
                (None, raw)
            };
        match scheme {
            Some(scheme) => {
                let (authority, remainder) = match rest.iter().position(|&b| b == b'/') {
                    Some(at) => (&rest[..at], Some(Bytes::copy_from_slice(&rest[at..]))),
                    None => (rest, None),
                };
                let (hostname, port) = parse_host_and_port(authority)?;
                Ok(Url {
                    scheme: Some(Bytes::from_static(scheme)),
                    hostname: Some(hostname),
                    port,
                    remainder,
                })
            }
            None => {
                let (hostname, port) = parse_host_and_port(raw)?;
                Ok(Url {
                    hostname: Some(hostname),
                    port,
                    ..Url::default()
                })
            }
        }
    }

    /// Hostname with any IPv6 brackets stripped, lossily decoded. Suitable
    /// for DNS resolution, SNI, and certificate subjects.
    pub fn host_str(&self) -> Option<String> {
        self.hostname.as_ref().map(|h| {
            let h = h.as_ref();
            let h = if h.first() == Some(&b'[') && h.last() == Some(&b']') {
                &h[1..h.len() - 1]
            } else {
                h
            };
            String::from_utf8_lossy(h).into_owned()
        })
    }
}

/// Split an authority token into host and optional port.
///
/// Zero colons: the whole token is the host. One colon: `host:port`, where a
/// non-numeric port is an error. Two or more colons: an IPv6 literal — a
/// bracketed form `[...]:port` splits at the colon after the closing bracket;
/// an unbracketed form is all host, since a port after a bare IPv6 address is
/// ambiguous. Unbracketed hosts containing `:` are canonicalised to `[...]`.
fn parse_host_and_port(raw: &[u8]) -> Result<(Bytes, Option<u16>), ProxyError> {
    let colons = raw.iter().filter(|&&b| b == b':').count();
    let (host, port): (&[u8], Option<u16>) = match colons {
        0 => (raw, None),
        1 => {
            let at = raw.iter().position(|&b| b == b':').unwrap();
            (&raw[..at], Some(parse_port(&raw[at + 1..])?))
        }
        _ => match raw.iter().position(|&b| b == b']') {
            // `[::1]:8443` — port follows the closing bracket.
            Some(close) if raw.get(close + 1) == Some(&b':') => {
                (&raw[..=close], Some(parse_port(&raw[close + 2..])?))
            }
            _ => (raw, None),
        },
    };
    let host = if host.contains(&b':') && host.first() != Some(&b'[') && host.last() != Some(&b']')
    {
        let mut bracketed = Vec::with_capacity(host.len() + 2);
        bracketed.push(b'[');
        bracketed.extend_from_slice(host);
        bracketed.push(b']');
        Bytes::from(bracketed)
    } else {
        Bytes::copy_from_slice(host)
    };
    Ok((host, port))
}

fn parse_port(raw: &[u8]) -> Result<u16, ProxyError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ProxyError::MalformedRequestTarget(format!(
                "invalid port {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref scheme) = self.scheme {
            write!(f, "{}://", String::from_utf8_lossy(scheme))?;
        }
        if let Some(ref hostname) = self.hostname {
            write!(f, "{}", String::from_utf8_lossy(hostname))?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(ref remainder) = self.remainder {
            write!(f, "{}", String::from_utf8_lossy(remainder))?;
        }
        Ok(())
    }
}
