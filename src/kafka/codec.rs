use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::kafka::types::Record;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Converts raw record payloads into the processor's event type. Decode
/// failures are reported and the record is skipped; delivery is
/// at-least-once, acceptance of malformed payloads is not.
pub trait PayloadDecoder<T>: Send + Sync {
    fn decode(&self, record: &Record) -> Result<T, DecodeError>;
}

/// JSON decoder for any deserializable event type.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> PayloadDecoder<T> for JsonDecoder<T>
where
    T: DeserializeOwned + Send,
{
    fn decode(&self, record: &Record) -> Result<T, DecodeError> {
        if record.payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(&record.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Span {
        trace_id: String,
        duration_us: u64,
    }

    #[test]
    fn test_json_decoder_roundtrip() {
        let decoder = JsonDecoder::<Span>::default();
        let record = Record::new_for_test(
            "traces-events",
            0,
            42,
            br#"{"trace_id":"abc","duration_us":1500}"#,
        );
        let span = decoder.decode(&record).unwrap();
        assert_eq!(
            span,
            Span {
                trace_id: "abc".to_string(),
                duration_us: 1500
            }
        );
    }

    #[test]
    fn test_json_decoder_rejects_garbage() {
        let decoder = JsonDecoder::<Span>::default();
        let record = Record::new_for_test("traces-events", 0, 42, b"not json");
        assert!(matches!(
            decoder.decode(&record),
            Err(DecodeError::Serde(_))
        ));
    }

    #[test]
    fn test_json_decoder_rejects_empty() {
        let decoder = JsonDecoder::<Span>::default();
        let record = Record::new_for_test("traces-events", 0, 42, b"");
        assert!(matches!(decoder.decode(&record), Err(DecodeError::Empty)));
    }
}
