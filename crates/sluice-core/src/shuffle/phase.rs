//! The two sides of a shuffle boundary as seen by a task.
//!
//! [`PhaseOutWriter`] turns records into encoded pairs on the sending side;
//! [`PhaseInReader`] turns delivered pairs back into records on the
//! receiving side, checking tag agreement and, optionally, that delivery
//! respects the order the consumer relies on.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use sluice_common::types::Record;
use sluice_common::utils::error::{CodecError, Error, Result};

use super::codec::ShuffleCodec;
use super::exchange::{PairReader, PairWriter};
use super::key::{BranchTag, GroupingKey, TaggedRecord};
use super::policy::ShufflePolicy;
use super::schema::ShuffleSchema;
use crate::execution::operators::{Operator, OperatorResult, TaggedOperator};

/// Encodes records of one branch into (key, payload) pairs.
#[derive(Debug, Clone)]
pub struct PhaseOutWriter {
    codec: ShuffleCodec,
    tag: Option<BranchTag>,
    key_slots: Vec<usize>,
}

impl PhaseOutWriter {
    /// Creates a writer for the branch `tag` selects in `schema`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the tag disagrees with the schema.
    pub fn new(schema: Arc<ShuffleSchema>, tag: Option<BranchTag>) -> Result<Self> {
        let key_slots = schema.branch(tag)?.key_slots();
        Ok(Self {
            codec: ShuffleCodec::bound(schema),
            tag,
            key_slots,
        })
    }

    /// Returns the codec in use.
    #[must_use]
    pub fn codec(&self) -> &ShuffleCodec {
        &self.codec
    }

    /// Lifts the key out of `record` and writes the encoded pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not fit the branch schema or the
    /// sink fails.
    pub fn write(&self, mut record: Record, out: &mut dyn PairWriter) -> Result<()> {
        let key = match self.tag {
            Some(tag) => GroupingKey::extract_tagged(&mut record, &self.key_slots, tag)?,
            None => GroupingKey::extract(&mut record, &self.key_slots)?,
        };
        let key_bytes = self.codec.encode_grouping_key(&key)?;
        let value_bytes = self.codec.encode_record(&record, self.tag)?;
        out.write_pair(&key_bytes, &value_bytes)
    }

    /// Writes every record `input` produces. Returns the number written.
    ///
    /// # Errors
    ///
    /// Returns the first error from the operator, the codec or the sink.
    pub fn drain(&self, input: &mut dyn Operator, out: &mut dyn PairWriter) -> Result<usize> {
        let mut written = 0;
        while let Some(record) = input.next()? {
            self.write(record, out)?;
            written += 1;
        }
        Ok(written)
    }
}

/// Checks delivered keys against the order a consumer depends on.
#[derive(Debug, Clone)]
pub struct OrderCheck {
    policy: Arc<dyn ShufflePolicy>,
    is_join: bool,
}

impl OrderCheck {
    /// Creates a check against `policy`. Violations in a join stage are
    /// reported as join ordering violations.
    #[must_use]
    pub fn new(policy: Arc<dyn ShufflePolicy>, is_join: bool) -> Self {
        Self { policy, is_join }
    }

    fn verify(&self, previous: &[u8], current: &[u8], position: usize) -> Result<()> {
        if self.policy.compare(previous, current) != Ordering::Greater {
            return Ok(());
        }
        let message = format!(
            "pair {position} is out of {} order: {:02x?} after {:02x?}",
            self.policy.name(),
            current,
            previous
        );
        Err(if self.is_join {
            Error::JoinOrder(message)
        } else {
            Error::Execution(message)
        })
    }
}

/// Decodes delivered pairs back into keys and payload records.
pub struct PhaseInReader {
    input: Box<dyn PairReader>,
    codec: ShuffleCodec,
    check: Option<OrderCheck>,
    previous: Option<Bytes>,
    position: usize,
}

impl PhaseInReader {
    /// Creates a reader decoding with `schema`.
    pub fn new(input: Box<dyn PairReader>, schema: Arc<ShuffleSchema>) -> Self {
        Self {
            input,
            codec: ShuffleCodec::bound(schema),
            check: None,
            previous: None,
            position: 0,
        }
    }

    /// Enables the delivery-order check.
    #[must_use]
    pub fn with_order_check(mut self, check: OrderCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Returns the next decoded key and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails, the key and payload tags disagree,
    /// or the order check fails.
    pub fn next_decoded(&mut self) -> Result<Option<(GroupingKey, Record)>> {
        let Some(pair) = self.input.next_pair()? else {
            return Ok(None);
        };
        if let Some(check) = &self.check {
            if let Some(previous) = &self.previous {
                check.verify(previous, &pair.key, self.position)?;
            }
            self.previous = Some(pair.key.clone());
        }
        self.position += 1;

        let key = self.codec.decode_key(&pair.key)?;
        let (tag, record) = self.codec.decode_record(&pair.value)?;
        if key.tag() != tag {
            return Err(CodecError::TagMismatch(format!(
                "key tag {:?} disagrees with payload tag {:?}",
                key.tag(),
                tag
            ))
            .into());
        }
        Ok(Some((key, record)))
    }
}

/// Reconstructs records after a single-branch shuffle.
pub struct PhaseInOperator {
    reader: PhaseInReader,
}

impl PhaseInOperator {
    /// Creates the operator.
    pub fn new(reader: PhaseInReader) -> Self {
        Self { reader }
    }
}

impl Operator for PhaseInOperator {
    fn next(&mut self) -> OperatorResult {
        let Some((key, mut record)) = self.reader.next_decoded()? else {
            return Ok(None);
        };
        key.rebuild(&mut record)?;
        Ok(Some(record))
    }

    fn name(&self) -> &'static str {
        "PhaseIn"
    }
}

/// Reconstructs records after a join shuffle, keeping their branch tags.
pub struct TaggedPhaseIn {
    reader: PhaseInReader,
}

impl TaggedPhaseIn {
    /// Creates the operator.
    pub fn new(reader: PhaseInReader) -> Self {
        Self { reader }
    }
}

impl TaggedOperator for TaggedPhaseIn {
    fn next_tagged(&mut self) -> Result<Option<TaggedRecord>> {
        match self.reader.next_decoded()? {
            Some((key, record)) => key.rebuild_tagged(record).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::testing::{MockScanOperator, rec};
    use crate::execution::operators::{SortKey, collect_records};
    use crate::shuffle::exchange::{ShufflePair, VecPairReader};
    use crate::shuffle::policy::{JoinPolicy, TotalOrderPolicy};
    use crate::shuffle::schema::BranchSchema;
    use sluice_common::types::{LogicalType, Value};

    fn single() -> Arc<ShuffleSchema> {
        Arc::new(ShuffleSchema::single(BranchSchema::new(
            vec![LogicalType::Int64, LogicalType::String],
            vec![SortKey::ascending(0)],
            0,
        )))
    }

    fn rows() -> Vec<Record> {
        vec![
            rec(vec![Value::Int64(2), Value::from("b")]),
            rec(vec![Value::Int64(1), Value::from("a")]),
        ]
    }

    #[test]
    fn test_out_then_in_restores_records() {
        let writer = PhaseOutWriter::new(single(), None).unwrap();
        let mut pairs: Vec<ShufflePair> = Vec::new();
        let written = writer.drain(&mut MockScanOperator::new(rows()), &mut pairs).unwrap();
        assert_eq!(written, 2);

        let reader = PhaseInReader::new(Box::new(VecPairReader::new(pairs)), single());
        let mut phase_in = PhaseInOperator::new(reader);
        assert_eq!(collect_records(&mut phase_in).unwrap(), rows());
    }

    #[test]
    fn test_order_check_rejects_unsorted_delivery() {
        let writer = PhaseOutWriter::new(single(), None).unwrap();
        let mut pairs: Vec<ShufflePair> = Vec::new();
        writer.drain(&mut MockScanOperator::new(rows()), &mut pairs).unwrap();

        let check = OrderCheck::new(Arc::new(TotalOrderPolicy), false);
        let reader = PhaseInReader::new(Box::new(VecPairReader::new(pairs)), single())
            .with_order_check(check);
        let mut phase_in = PhaseInOperator::new(reader);
        assert!(phase_in.next().unwrap().is_some());
        assert!(matches!(phase_in.next(), Err(Error::Execution(_))));
    }

    #[test]
    fn test_join_order_violation() {
        let branch = BranchSchema::new(vec![LogicalType::Int64], vec![SortKey::ascending(0)], 0);
        let schema = Arc::new(ShuffleSchema::join(branch.clone(), branch));
        let probe = PhaseOutWriter::new(schema.clone(), Some(BranchTag::PROBE)).unwrap();
        let build = PhaseOutWriter::new(schema.clone(), Some(BranchTag::BUILD)).unwrap();

        let mut pairs: Vec<ShufflePair> = Vec::new();
        probe.write(rec(vec![Value::Int64(1)]), &mut pairs).unwrap();
        build.write(rec(vec![Value::Int64(1)]), &mut pairs).unwrap();

        let check = OrderCheck::new(Arc::new(JoinPolicy::new(1)), true);
        let reader =
            PhaseInReader::new(Box::new(VecPairReader::new(pairs)), schema).with_order_check(check);
        let mut phase_in = TaggedPhaseIn::new(reader);
        let first = phase_in.next_tagged().unwrap().unwrap();
        assert_eq!(first.tag, BranchTag::PROBE);
        assert!(matches!(phase_in.next_tagged(), Err(Error::JoinOrder(_))));
    }

    #[test]
    fn test_tag_disagreement_is_rejected() {
        let branch = BranchSchema::new(vec![LogicalType::Int64], vec![SortKey::ascending(0)], 0);
        let schema = Arc::new(ShuffleSchema::join(branch.clone(), branch));
        let writer = PhaseOutWriter::new(schema.clone(), Some(BranchTag::BUILD)).unwrap();
        let mut pairs: Vec<ShufflePair> = Vec::new();
        writer.write(rec(vec![Value::Int64(1)]), &mut pairs).unwrap();

        let mut value = pairs[0].value.to_vec();
        value[0] = 0;
        pairs[0].value = value.into();
        let mut reader = PhaseInReader::new(Box::new(VecPairReader::new(pairs)), schema);
        assert!(matches!(
            reader.next_decoded(),
            Err(Error::Codec(CodecError::TagMismatch(_)))
        ));
    }
}
