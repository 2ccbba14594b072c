use std::fmt;

use crate::errors::CodecError;

/// Number of buttons in an action vector.
pub const ACTION_SIZE: usize = 4;

/// A discrete control input: one boolean per button, in payload order.
///
/// On the wire each button is one byte; `'0'` is released and any other
/// byte is pressed. Masters emit `'1'` for pressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Action(pub [bool; ACTION_SIZE]);

impl Action {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let bytes: [u8; ACTION_SIZE] =
            payload
                .try_into()
                .map_err(|_| CodecError::InvalidPayloadSize {
                    expected: ACTION_SIZE,
                    actual: payload.len(),
                })?;
        Ok(Self(bytes.map(|b| b != b'0')))
    }

    pub fn encode(&self) -> [u8; ACTION_SIZE] {
        self.0.map(|pressed| if pressed { b'1' } else { b'0' })
    }

    pub fn buttons(&self) -> [bool; ACTION_SIZE] {
        self.0
    }
}

impl From<[bool; ACTION_SIZE]> for Action {
    fn from(buttons: [bool; ACTION_SIZE]) -> Self {
        Self(buttons)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.encode() {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_payloads() {
        assert_eq!(
            Action::decode(b"1001").unwrap().buttons(),
            [true, false, false, true]
        );
        assert_eq!(Action::decode(b"0000").unwrap().buttons(), [false; 4]);
    }

    #[test]
    fn any_non_zero_byte_is_pressed() {
        assert_eq!(
            Action::decode(b"x0\x00 ").unwrap().buttons(),
            [true, false, true, true]
        );
    }

    #[test]
    fn decode_matches_bytewise_rule_for_all_bytes() {
        for b in 0..=u8::MAX {
            let payload = [b, b'0', b, b'0'];
            let act = Action::decode(&payload).unwrap().buttons();
            let pressed = b != b'0';
            assert_eq!(act, [pressed, false, pressed, false]);
        }
    }

    #[test]
    fn wrong_lengths_rejected() {
        for payload in [&b""[..], b"1", b"101", b"10010", b"0000000000"] {
            let err = Action::decode(payload).unwrap_err();
            assert_eq!(
                err,
                CodecError::InvalidPayloadSize {
                    expected: 4,
                    actual: payload.len()
                }
            );
        }
    }

    #[test]
    fn encode_uses_ascii_digits() {
        let act = Action::from([true, false, true, true]);
        assert_eq!(&act.encode(), b"1011");
        assert_eq!(act.to_string(), "1011");
    }

    #[test]
    fn encode_inverts_decode() {
        let act = Action::from([false, true, true, false]);
        assert_eq!(Action::decode(&act.encode()).unwrap(), act);
    }
}
