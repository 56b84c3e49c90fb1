use crate::errors::*;

const CHARS: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

err_impl! {NameError,
    #[error("invalid input: {0:?} is not a valid escaped name")]
    InvalidInput(String),
}

// escape_name maps an arbitrary string bijectively into the Kubernetes
// DNS-1123 label grammar '^[a-z0-9]([-a-z0-9]*[a-z0-9])?$'.  The digit '9'
// acts as the escape marker, so '0'..'8' are literal but '9' itself is
// escaped; '-' is literal except at either end of the input.
pub fn escape_name(input: &str) -> String {
    let bytes = input.as_bytes();
    let n = bytes.len();
    let mut out = String::with_capacity(n);
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'0'..=b'8' | b'a'..=b'z' => out.push(b as char),
            b'-' if i > 0 && i + 1 < n => out.push('-'),
            _ => {
                out.push('9');
                out.push(CHARS[(b / 36) as usize] as char);
                out.push(CHARS[(b % 36) as usize] as char);
            },
        }
    }
    out
}

// unescape_name performs the reverse transformation of escape_name.
pub fn unescape_name(input: &str) -> anyhow::Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'9' {
            out.push(unescape_byte(bytes, i).ok_or_else(|| NameError::invalid_input(input))?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| NameError::invalid_input(input))
}

fn unescape_byte(bytes: &[u8], i: usize) -> Option<u8> {
    if bytes.len() - i < 3 {
        return None;
    }
    let b = decode_base36(bytes[i + 1])? * 36 + decode_base36(bytes[i + 2])?;
    u8::try_from(b).ok()
}

fn decode_base36(b: u8) -> Option<u32> {
    match b {
        b'a'..=b'z' => Some((b - b'a') as u32),
        b'0'..=b'9' => Some((b - b'0') as u32 + 26),
        _ => None,
    }
}
