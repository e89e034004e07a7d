//! IMAP line parsing
//!
//! Pure functions over a single line with its CRLF already stripped.

use super::types::MAX_LITERAL_DIGITS;

/// Trailing literal declaration of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    /// Line does not end in `}`
    None,
    /// Line ends in `}` but the length is malformed
    Invalid,
    /// `{N}` or `{N+}`
    Size(u64),
}

/// Client command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine<'a> {
    pub tag: &'a str,
    pub name: &'a str,
    pub arg: Option<&'a str>,
}

/// Server response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub tag: &'a str,
    pub status: &'a str,
    pub text: Option<&'a str>,
}

/// Split at the first space
pub fn split_token(s: &str) -> (&str, Option<&str>) {
    match s.split_once(' ') {
        Some((token, rest)) => (token, Some(rest)),
        None => (s, None),
    }
}

/// Parse `tag SP name [SP arg]`; None when the tag is not followed by a space
pub fn parse_command(line: &str) -> Option<CommandLine<'_>> {
    let (tag, rest) = split_token(line);
    let (name, arg) = split_token(rest?);
    Some(CommandLine {
        tag,
        name,
        arg: arg.filter(|a| !a.is_empty()),
    })
}

/// Parse `tag SP status [SP text]`; None when the tag is not followed by a space
pub fn parse_response(line: &str) -> Option<ResponseLine<'_>> {
    let (tag, rest) = split_token(line);
    let (status, text) = split_token(rest?);
    Some(ResponseLine {
        tag,
        status,
        text: text.filter(|t| !t.is_empty()),
    })
}

/// Status tokens only a server sends
pub fn is_status_token(token: &str) -> bool {
    ["OK", "NO", "BAD", "BYE"]
        .iter()
        .any(|s| token.eq_ignore_ascii_case(s))
}

/// Whether the first line seen on a flow was sent by the server
pub fn is_server_line(line: &str) -> bool {
    let (tag, rest) = split_token(line);
    if tag == "*" {
        return true;
    }
    rest.map(|r| is_status_token(split_token(r).0)).unwrap_or(false)
}

/// Scan a line for a trailing `{N}` / `{N+}`
pub fn parse_literal(line: &[u8]) -> Literal {
    let len = line.len();
    if len <= 3 || line[len - 1] != b'}' {
        return Literal::None;
    }

    let mut end = len - 1;
    if line[end - 1] == b'+' {
        end -= 1;
    }

    let mut start = end;
    while start > 0 && line[start - 1].is_ascii_digit() {
        start -= 1;
    }

    let digits = end - start;
    if digits == 0 || digits > MAX_LITERAL_DIGITS || start == 0 || line[start - 1] != b'{' {
        return Literal::Invalid;
    }

    std::str::from_utf8(&line[start..end])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Literal::Size)
        .unwrap_or(Literal::Invalid)
}

/// Guess whether bytes following a COMPRESS/STARTTLS request are no longer
/// plain IMAP.
///
/// Scans up to the first CR/LF: any non-printable byte means the layer
/// changed; so does a line shorter than 3 bytes or one without a space.
pub fn takeover_heuristic(buf: &[u8]) -> bool {
    let mut scanned = 0;
    let mut has_space = false;

    for &b in buf {
        if b == b'\r' || b == b'\n' {
            break;
        }
        if !(b' '..=b'~').contains(&b) {
            return true;
        }
        if b == b' ' {
            has_space = true;
        }
        scanned += 1;
    }

    scanned < 3 || !has_space
}

/// Case-insensitive ASCII prefix match
pub fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
