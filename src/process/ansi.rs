//! Escape-sequence stripping for process output.
//!
//! Agents paint their TUIs with colour codes, cursor movement and window
//! title updates. The classifier and the session log want plain text, so
//! every chunk is cleaned here while the raw bytes go to the terminal view
//! untouched.

/// Remove ANSI/VT escape sequences from `input`.
///
/// Recognised forms:
/// - CSI `ESC [ params final` (the 8-bit `0x9B` form is left alone since it
///   collides with UTF-8 continuation bytes)
/// - OSC `ESC ] ... BEL` or `ESC ] ... ESC \`
/// - DCS/SOS/PM/APC strings (`ESC P`, `ESC X`, `ESC ^`, `ESC _`) up to ST
/// - two-byte escapes such as `ESC 7` or `ESC M`
///
/// Carriage returns are kept; line normalisation is the consumer's job.
/// Invalid UTF-8 is replaced lossily.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter().copied().peekable();

    while let Some(b) = bytes.next() {
        match b {
            0x1B => match bytes.next() {
                Some(b'[') => skip_csi(&mut bytes),
                Some(b']') | Some(b'P') | Some(b'X') | Some(b'^') | Some(b'_') => {
                    skip_string(&mut bytes)
                }
                // Two-byte escape, or a dangling ESC at the end of the chunk
                Some(_) | None => {}
            },
            // Other C0 controls except tab, newline and carriage return
            0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1A | 0x1C..=0x1F | 0x7F => {}
            _ => out.push(b),
        }
    }

    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Skip parameter/intermediate bytes and the final byte of a CSI sequence.
fn skip_csi<I: Iterator<Item = u8>>(bytes: &mut std::iter::Peekable<I>) {
    while let Some(&b) = bytes.peek() {
        bytes.next();
        if (0x40..=0x7E).contains(&b) {
            break;
        }
        if !(0x20..=0x3F).contains(&b) {
            // Malformed sequence; drop what we consumed and resume
            break;
        }
    }
}

/// Skip a control string terminated by BEL or `ESC \`.
fn skip_string<I: Iterator<Item = u8>>(bytes: &mut std::iter::Peekable<I>) {
    while let Some(b) = bytes.next() {
        match b {
            0x07 => break,
            0x1B => {
                if bytes.peek() == Some(&b'\\') {
                    bytes.next();
                }
                break;
            }
            _ => {}
        }
    }
}

/// Length of the longest prefix of `data` that ends on a UTF-8 boundary.
///
/// PTY reads can split a multi-byte character across chunks. Readers hold
/// back the incomplete tail and prepend it to the next read.
pub fn complete_utf8_prefix(data: &[u8]) -> usize {
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can be partial
    let start = data.len().saturating_sub(3);
    for i in (start..data.len()).rev() {
        let b = data[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            // Continuation byte; keep looking for the lead byte
            continue;
        }
        let needed = if b & 0b1000_0000 == 0 {
            1
        } else if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            // Not a valid lead byte; let lossy decoding deal with it
            return data.len();
        };
        return if data.len() - i >= needed { data.len() } else { i };
    }
    data.len()
}

/// Longest unterminated escape sequence readers hold back before giving up
const MAX_PENDING_ESCAPE: usize = 4096;

/// Length of the prefix of `data` that ends outside an escape sequence.
///
/// A read can stop in the middle of `ESC [ 3 1 m`; stripping the halves
/// separately would leak the parameter bytes into the clean text. Readers
/// hold back an unterminated trailing sequence the same way they hold back
/// a partial UTF-8 character.
pub fn complete_escape_prefix(data: &[u8]) -> usize {
    let Some(start) = data.iter().rposition(|&b| b == 0x1B) else {
        return data.len();
    };
    let pending = &data[start..];
    if pending.len() > MAX_PENDING_ESCAPE || escape_terminated(pending) {
        data.len()
    } else {
        start
    }
}

/// Whether `seq`, starting at ESC, holds a whole escape sequence
fn escape_terminated(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => false,
        // Any byte outside the parameter/intermediate range ends a CSI
        Some(b'[') => seq[2..].iter().any(|b| !(0x20..=0x3F).contains(b)),
        Some(b']') | Some(b'P') | Some(b'X') | Some(b'^') | Some(b'_') => {
            seq[2..].contains(&0x07)
        }
        Some(_) => true,
    }
}

/// Length of the prefix of `data` that is safe to decode and strip now
pub fn complete_prefix(data: &[u8]) -> usize {
    complete_utf8_prefix(data).min(complete_escape_prefix(data))
}
