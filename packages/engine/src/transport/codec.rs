// packages/engine/src/transport/codec.rs
//! Envelope wire codec
//!
//! Each envelope is one CBOR document. A per-neighbor batch frames them as
//! `u32 count` followed by `u32 len + bytes` per envelope, preserving
//! queue order. Encoding is deterministic, so decode-then-encode
//! reproduces the input bytes.

use crate::comm::{pack_frames, unpack_frames};
use crate::transport::envelope::{Envelope, Payload};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;

pub fn encode_envelope<P: Payload, const D: usize>(envelope: &Envelope<P, D>) -> Result<Vec<u8>> {
    serde_cbor::to_vec(envelope).map_err(|e| EngineError::Codec(format!("envelope does not encode: {}", e)))
}

pub fn decode_envelope<P: Payload, const D: usize>(data: &[u8]) -> Result<Envelope<P, D>> {
    serde_cbor::from_slice(data).map_err(|e| EngineError::Codec(format!("envelope does not decode: {}", e)))
}

/// Frame a neighbor's envelopes in queue order
pub fn encode_batch<P: Payload, const D: usize>(envelopes: &[Envelope<P, D>]) -> Result<Bytes> {
    let encoded = envelopes.iter().map(encode_envelope).collect::<Result<Vec<_>>>()?;
    Ok(pack_frames(&encoded))
}

pub fn decode_batch<P: Payload, const D: usize>(data: Bytes) -> Result<Vec<Envelope<P, D>>> {
    unpack_frames(data)?.iter().map(|frame| decode_envelope(frame)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::geometry::RealPoint;
    use crate::transport::envelope::ScheduleMeta;
    use crate::utils::ids::EntityId;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum TestPayload {
        Agent { id: u64, energy: f64, tag: String },
        Heat(f64),
    }

    impl Payload for TestPayload {
        fn entity_id(&self) -> Option<EntityId> {
            match self {
                TestPayload::Agent { id, .. } => Some(EntityId(*id)),
                TestPayload::Heat(_) => None,
            }
        }
    }

    fn time_strategy() -> impl Strategy<Value = Option<f64>> {
        proptest::option::of(0.0f64..1e6)
    }

    fn schedule_strategy() -> impl Strategy<Value = ScheduleMeta> {
        prop_oneof![
            Just(ScheduleMeta::Static),
            (any::<i32>(), time_strategy()).prop_map(|(ordering, time)| ScheduleMeta::Once { ordering, time }),
            (any::<i32>(), time_strategy(), 0.001f64..100.0).prop_map(|(ordering, time, interval)| ScheduleMeta::Repeating {
                ordering,
                time,
                interval
            }),
        ]
    }

    fn payload_strategy() -> impl Strategy<Value = TestPayload> {
        prop_oneof![
            (any::<u64>(), -1e9f64..1e9, "[a-z]{0,12}").prop_map(|(id, energy, tag)| TestPayload::Agent {
                id,
                energy,
                tag
            }),
            (-1e9f64..1e9).prop_map(TestPayload::Heat),
        ]
    }

    fn envelope_strategy() -> impl Strategy<Value = Envelope<TestPayload, 2>> {
        (
            0usize..64,
            0usize..64,
            proptest::option::of((-1e6f64..1e6, -1e6f64..1e6)),
            proptest::option::of(0u32..8),
            schedule_strategy(),
            proptest::option::of("[a-z0-9-]{1,16}"),
            payload_strategy(),
        )
            .prop_map(|(source, destination, location, field, schedule, exported_name, payload)| Envelope {
                source,
                destination,
                location: location.map(|(x, y)| RealPoint([x, y])),
                field,
                schedule,
                exported_name,
                payload,
            })
    }

    proptest! {
        #[test]
        fn test_envelope_round_trip(envelope in envelope_strategy()) {
            let bytes = encode_envelope(&envelope).unwrap();
            let decoded: Envelope<TestPayload, 2> = decode_envelope(&bytes).unwrap();
            prop_assert_eq!(&decoded, &envelope);
            prop_assert_eq!(encode_envelope(&decoded).unwrap(), bytes);
        }

        #[test]
        fn test_batch_preserves_order(envelopes in proptest::collection::vec(envelope_strategy(), 0..8)) {
            let batch = encode_batch(&envelopes).unwrap();
            let decoded: Vec<Envelope<TestPayload, 2>> = decode_batch(batch).unwrap();
            prop_assert_eq!(decoded, envelopes);
        }
    }

    #[test]
    fn test_corrupt_envelope_rejected() {
        let envelope = Envelope {
            source: 0,
            destination: 1,
            location: Some(RealPoint([1.0, 2.0])),
            field: Some(0),
            schedule: ScheduleMeta::Once { ordering: 0, time: None },
            exported_name: None,
            payload: TestPayload::Heat(1.5),
        };
        let bytes = encode_envelope(&envelope).unwrap();
        let result: Result<Envelope<TestPayload, 2>> = decode_envelope(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(EngineError::Codec(_))));
        assert!(EngineError::Codec(String::new()).is_fatal());
    }
}
