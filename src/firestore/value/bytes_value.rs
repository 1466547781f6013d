use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};

/// Opaque byte string, carried on the wire as padded base64.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Accepts both padded and unpadded input.
    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD
            .decode(value)
            .or_else(|_| STANDARD_NO_PAD.decode(value.trim_end_matches('=')))
            .map(Self)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for BytesValue {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_padded_and_unpadded_input() {
        let bytes = BytesValue::new(vec![1, 2, 3, 4]);
        assert_eq!(bytes.to_base64(), "AQIDBA==");
        assert_eq!(BytesValue::from_base64("AQIDBA==").unwrap(), bytes);
        assert_eq!(BytesValue::from_base64("AQIDBA").unwrap(), bytes);
    }
}
