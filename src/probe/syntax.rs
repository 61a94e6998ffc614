//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Smtprobe.
//
// Smtprobe is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtprobe is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Smtprobe. If not, see <http://www.gnu.org/licenses/>.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Exactly one '@' with non-empty halves and none of the characters
    // which would break the MAIL/RCPT command syntax. Deliberately far
    // looser than RFC 5321 address grammar; the point is to reject
    // obviously broken input before it reaches the wire, not to validate
    // mailboxes.
    static ref RX_ADDRESS: Regex =
        Regex::new("^[^\\s<>,@]+@[^\\s<>,@]+$").unwrap();
}

pub fn is_valid_address(s: &str) -> bool {
    RX_ADDRESS.is_match(s)
}

/// One parsed server reply line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply<'a> {
    pub code: u16,
    /// Whether this is the final line of the reply.
    pub last: bool,
    pub text: &'a str,
}

/// Parses a reply line per RFC 5321 section 4.2, tolerating both CRLF and
/// UNIX line endings.
pub fn parse_reply(s: &str) -> Option<Reply<'_>> {
    let s = s.trim_end_matches(['\r', '\n']);
    let code = s.get(0..3)?.parse::<u16>().ok()?;
    let (last, text) = match s.get(3..4) {
        // The textstring is optional; a bare code is a final line.
        None => (true, ""),
        Some(" ") => (true, s.get(4..)?),
        Some("-") => (false, s.get(4..)?),
        Some(_) => return None,
    };

    Some(Reply { code, last, text })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_validity() {
        assert!(is_valid_address("zim@earth.com"));
        assert!(is_valid_address("tallest+red@irk.example"));

        assert!(!is_valid_address(""));
        assert!(!is_valid_address("zim"));
        assert!(!is_valid_address("zim@"));
        assert!(!is_valid_address("@earth.com"));
        assert!(!is_valid_address("zim@earth@com"));
        assert!(!is_valid_address("zim dib@earth.com"));
        assert!(!is_valid_address("<zim@earth.com>"));
        assert!(!is_valid_address("zim@earth.com,dib@earth.com"));
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(
            Some(Reply {
                code: 250,
                last: true,
                text: "OK",
            }),
            parse_reply("250 OK\r\n"),
        );
        assert_eq!(
            Some(Reply {
                code: 250,
                last: false,
                text: "STARTTLS",
            }),
            parse_reply("250-STARTTLS\n"),
        );
        assert_eq!(
            Some(Reply {
                code: 550,
                last: true,
                text: "",
            }),
            parse_reply("550 "),
        );
        assert_eq!(
            Some(Reply {
                code: 250,
                last: true,
                text: "",
            }),
            parse_reply("250\r\n"),
        );

        assert_eq!(None, parse_reply(""));
        assert_eq!(None, parse_reply("25"));
        assert_eq!(None, parse_reply("250_OK"));
        assert_eq!(None, parse_reply("HTTP/1.1 400 Bad Request"));
        assert_eq!(None, parse_reply("2x0 OK"));
    }
}
