//! Badge payload parsing.
//!
//! A member badge is a QR code holding the member's user id as a
//! hyphenated UUID v4: 36 characters, version nibble `4`, variant nibble
//! one of `8 9 a b`, hex digits in either case.

use crate::types::UserId;
use uuid::Uuid;

/// What a scanned payload turned out to be
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Badge {
    /// Nothing but whitespace
    Blank,
    /// Not a member badge
    Invalid,
    /// A well-formed member id
    Member(UserId),
}

const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// Classify a raw payload. Surrounding whitespace is ignored.
#[must_use]
pub fn read_badge(payload: &str) -> Badge {
    let text = payload.trim();
    if text.is_empty() {
        return Badge::Blank;
    }
    if !is_uuid_v4(text) {
        return Badge::Invalid;
    }
    Uuid::parse_str(text).map_or(Badge::Invalid, |uuid| Badge::Member(UserId::from_uuid(uuid)))
}

fn is_uuid_v4(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    let shape = bytes.iter().enumerate().all(|(i, b)| {
        if HYPHENS.contains(&i) {
            *b == b'-'
        } else {
            b.is_ascii_hexdigit()
        }
    });
    shape && bytes[14] == b'4' && matches!(bytes[19].to_ascii_lowercase(), b'8' | b'9' | b'a' | b'b')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_v4_in_any_case_with_padding() {
        let id = "3f2b8c1e-9a4d-4e6f-8b7a-0c1d2e3f4a5b";
        assert!(matches!(read_badge(id), Badge::Member(_)));
        assert!(matches!(read_badge(&id.to_uppercase()), Badge::Member(_)));
        assert!(matches!(read_badge(&format!("  {id}\n")), Badge::Member(_)));
    }

    #[test]
    fn rejects_other_versions_and_variants() {
        // version 1
        assert_eq!(read_badge("3f2b8c1e-9a4d-1e6f-8b7a-0c1d2e3f4a5b"), Badge::Invalid);
        // variant nibble c
        assert_eq!(read_badge("3f2b8c1e-9a4d-4e6f-cb7a-0c1d2e3f4a5b"), Badge::Invalid);
    }

    #[test]
    fn rejects_other_layouts() {
        assert_eq!(read_badge("3f2b8c1e9a4d4e6f8b7a0c1d2e3f4a5b"), Badge::Invalid);
        assert_eq!(read_badge("{3f2b8c1e-9a4d-4e6f-8b7a-0c1d2e3f4a5b}"), Badge::Invalid);
        assert_eq!(read_badge("https://club.example/members/42"), Badge::Invalid);
        assert_eq!(read_badge("3f2b8c1e-9a4d-4e6f-8b7a-0c1d2e3f4a5g"), Badge::Invalid);
    }

    #[test]
    fn blank_payloads_are_blank() {
        assert_eq!(read_badge(""), Badge::Blank);
        assert_eq!(read_badge(" \t "), Badge::Blank);
    }

    proptest! {
        #[test]
        fn every_generated_member_id_is_readable(bytes in any::<[u8; 16]>()) {
            let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
            prop_assert_eq!(read_badge(&uuid.to_string()), Badge::Member(UserId::from_uuid(uuid)));
        }
    }
}
