//! Durable transaction records and their state transitions.

use crate::error::{CoreError, CoreResult};
use crate::types::{Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic bytes opening every record envelope in the transaction log.
pub const RECORD_MAGIC: [u8; 4] = *b"KTXN";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// Envelope header: magic, version, payload length.
pub(crate) const HEADER_LEN: usize = 4 + 2 + 4;

/// Envelope trailer: CRC32 of the payload.
pub(crate) const TRAILER_LEN: usize = 4;

const FLAG_READ_ONLY: u8 = 0b0000_0001;

/// Stored state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Running; its writes are invisible to everyone else.
    Active,
    /// Committed; visible to snapshots at or after its commit timestamp.
    Committed,
    /// Rolled back by its owner or declared abandoned.
    RolledBack,
    /// Failed; treated like a rollback for visibility.
    Error,
}

impl TxnState {
    /// Returns true for every state except [`TxnState::Active`].
    #[must_use]
    pub const fn is_finished(self) -> bool {
        !matches!(self, Self::Active)
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Committed => 2,
            Self::RolledBack => 3,
            Self::Error => 4,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Active),
            2 => Some(Self::Committed),
            3 => Some(Self::RolledBack),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Error => "ERROR",
        })
    }
}

/// Final outcome of a transaction, as far as readers are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalStatus {
    /// Committed at the given timestamp.
    Committed(Timestamp),
    /// Rolled back, failed or abandoned. Its writes are never visible.
    RolledBack,
}

/// Status of a transaction as seen by a reader at a point in time.
///
/// Unlike [`TxnState`] this accounts for keep-alive expiry: an `Active`
/// record that has not been renewed within the timeout is `Abandoned`,
/// whether or not anyone has written that back yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    /// Still running.
    Active,
    /// Committed at the given timestamp.
    Committed(Timestamp),
    /// Rolled back.
    RolledBack,
    /// Failed.
    Error,
    /// Stored as active but past its keep-alive deadline.
    Abandoned,
}

impl TxnStatus {
    /// Returns the final status, or `None` while the transaction is live.
    #[must_use]
    pub const fn final_status(self) -> Option<FinalStatus> {
        match self {
            Self::Active => None,
            Self::Committed(ts) => Some(FinalStatus::Committed(ts)),
            Self::RolledBack | Self::Error | Self::Abandoned => Some(FinalStatus::RolledBack),
        }
    }

    /// Returns the commit timestamp if committed.
    #[must_use]
    pub const fn commit_timestamp(self) -> Option<Timestamp> {
        match self {
            Self::Committed(ts) => Some(ts),
            _ => None,
        }
    }
}

/// A requested change to a transaction record.
///
/// Transitions are applied atomically by the store, so when several
/// components race to finalize the same transaction exactly one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// ACTIVE → COMMITTED, unless the record has expired.
    Commit {
        /// Commit timestamp from the oracle.
        commit_ts: Timestamp,
        /// Current wall-clock time (ms).
        now: u64,
        /// Keep-alive timeout (ms).
        timeout_ms: u64,
    },
    /// ACTIVE → ROLLED_BACK.
    Rollback,
    /// ACTIVE → ERROR.
    Fail,
    /// Re-stamp `last_keep_alive`, unless the record has expired.
    KeepAlive {
        /// Current wall-clock time (ms).
        now: u64,
        /// Keep-alive timeout (ms).
        timeout_ms: u64,
    },
    /// ACTIVE → ROLLED_BACK, only if the record has expired.
    Abandon {
        /// Current wall-clock time (ms).
        now: u64,
        /// Keep-alive timeout (ms).
        timeout_ms: u64,
    },
}

/// Result of applying a [`Transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record changed to the contained image.
    Applied(TxnRecord),
    /// The record already reflected the transition.
    Unchanged(TxnRecord),
    /// The transition does not apply. The contained image is the record as
    /// it now stands, which differs from the stored one when the attempt
    /// itself discovered that the transaction had expired.
    Rejected(TxnRecord),
}

impl TransitionOutcome {
    /// Returns the record image after the transition attempt.
    #[must_use]
    pub const fn record(&self) -> &TxnRecord {
        match self {
            Self::Applied(r) | Self::Unchanged(r) | Self::Rejected(r) => r,
        }
    }

    /// Returns true unless the transition was rejected.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Durable record of one transaction.
///
/// `commit_ts` is set if and only if `state` is [`TxnState::Committed`], and
/// a finished record never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRecord {
    /// Transaction id (equal to `begin_ts`).
    pub id: TransactionId,
    /// Stored state.
    pub state: TxnState,
    /// Begin timestamp, also the snapshot timestamp.
    pub begin_ts: Timestamp,
    /// Commit timestamp, set on commit.
    pub commit_ts: Option<Timestamp>,
    /// Last keep-alive, in wall-clock milliseconds.
    pub last_keep_alive: u64,
    /// Whether the transaction was started read-only.
    pub read_only: bool,
}

impl TxnRecord {
    /// Creates the ACTIVE record of a transaction beginning at `begin_ts`.
    #[must_use]
    pub fn begin(begin_ts: Timestamp, now: u64, read_only: bool) -> Self {
        Self {
            id: TransactionId::from_begin(begin_ts),
            state: TxnState::Active,
            begin_ts,
            commit_ts: None,
            last_keep_alive: now,
            read_only,
        }
    }

    /// Returns true once the record can no longer change.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Returns true if the record is ACTIVE but was not renewed in time.
    #[must_use]
    pub fn is_expired(&self, now: u64, timeout_ms: u64) -> bool {
        self.state == TxnState::Active && now.saturating_sub(self.last_keep_alive) > timeout_ms
    }

    /// Returns the status a reader should act on at time `now`.
    #[must_use]
    pub fn status(&self, now: u64, timeout_ms: u64) -> TxnStatus {
        match self.state {
            TxnState::Active if self.is_expired(now, timeout_ms) => TxnStatus::Abandoned,
            TxnState::Active => TxnStatus::Active,
            TxnState::Committed => match self.commit_ts {
                Some(ts) => TxnStatus::Committed(ts),
                None => TxnStatus::Error,
            },
            TxnState::RolledBack => TxnStatus::RolledBack,
            TxnState::Error => TxnStatus::Error,
        }
    }

    fn with_state(self, state: TxnState) -> Self {
        Self { state, ..self }
    }

    /// Applies `transition` to this record image without side effects.
    #[must_use]
    pub fn apply(&self, transition: &Transition) -> TransitionOutcome {
        use TransitionOutcome::{Applied, Rejected, Unchanged};

        match (*transition, self.state) {
            (Transition::Commit { now, timeout_ms, .. }, TxnState::Active)
                if self.is_expired(now, timeout_ms) =>
            {
                Rejected(self.with_state(TxnState::RolledBack))
            }
            (Transition::Commit { commit_ts, .. }, TxnState::Active) => Applied(Self {
                state: TxnState::Committed,
                commit_ts: Some(commit_ts),
                ..*self
            }),

            (Transition::Rollback, TxnState::Active) => Applied(self.with_state(TxnState::RolledBack)),
            (Transition::Rollback, TxnState::RolledBack) => Unchanged(*self),

            (Transition::Fail, TxnState::Active) => Applied(self.with_state(TxnState::Error)),
            (Transition::Fail, TxnState::Error) => Unchanged(*self),

            (Transition::KeepAlive { now, timeout_ms }, TxnState::Active)
                if self.is_expired(now, timeout_ms) =>
            {
                Rejected(self.with_state(TxnState::RolledBack))
            }
            (Transition::KeepAlive { now, .. }, TxnState::Active) => Applied(Self {
                last_keep_alive: self.last_keep_alive.max(now),
                ..*self
            }),

            (Transition::Abandon { now, timeout_ms }, TxnState::Active)
                if self.is_expired(now, timeout_ms) =>
            {
                Applied(self.with_state(TxnState::RolledBack))
            }
            (Transition::Abandon { .. }, TxnState::RolledBack) => Unchanged(*self),

            _ => Rejected(*self),
        }
    }

    /// Serializes the record body (without envelope).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(35);
        buf.extend_from_slice(&self.id.as_u64().to_le_bytes());
        buf.push(self.state.as_byte());
        buf.extend_from_slice(&self.begin_ts.as_u64().to_le_bytes());
        match self.commit_ts {
            Some(ts) => {
                buf.push(1);
                buf.extend_from_slice(&ts.as_u64().to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.last_keep_alive.to_le_bytes());
        buf.push(if self.read_only { FLAG_READ_ONLY } else { 0 });
        buf
    }

    /// Deserializes a record body.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] for truncated input, trailing bytes,
    /// unknown states or a commit timestamp inconsistent with the state.
    pub fn decode_payload(payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = 0usize;

        let read_u64 = |cursor: &mut usize| -> CoreResult<u64> {
            let bytes: [u8; 8] = payload
                .get(*cursor..*cursor + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| CoreError::corruption("unexpected end of record"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };
        let read_u8 = |cursor: &mut usize| -> CoreResult<u8> {
            let b = *payload
                .get(*cursor)
                .ok_or_else(|| CoreError::corruption("unexpected end of record"))?;
            *cursor += 1;
            Ok(b)
        };

        let id = TransactionId::new(read_u64(&mut cursor)?);
        let state_byte = read_u8(&mut cursor)?;
        let state = TxnState::from_byte(state_byte)
            .ok_or_else(|| CoreError::corruption(format!("unknown state byte {state_byte}")))?;
        let begin_ts = Timestamp::new(read_u64(&mut cursor)?);
        let commit_ts = match read_u8(&mut cursor)? {
            0 => None,
            1 => Some(Timestamp::new(read_u64(&mut cursor)?)),
            other => {
                return Err(CoreError::corruption(format!(
                    "invalid commit flag {other}"
                )))
            }
        };
        let last_keep_alive = read_u64(&mut cursor)?;
        let flags = read_u8(&mut cursor)?;

        if cursor != payload.len() {
            return Err(CoreError::corruption(format!(
                "trailing bytes in record: expected {} bytes, got {}",
                cursor,
                payload.len()
            )));
        }
        if commit_ts.is_some() != (state == TxnState::Committed) {
            return Err(CoreError::corruption(format!(
                "record {id} is {state} but commit timestamp is {commit_ts:?}"
            )));
        }

        Ok(Self {
            id,
            state,
            begin_ts,
            commit_ts,
            last_keep_alive,
            read_only: flags & FLAG_READ_ONLY != 0,
        })
    }

    /// Serializes the record inside a checksummed envelope.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf
    }

    /// Deserializes one envelope from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] on bad magic, unknown version,
    /// truncated input or checksum mismatch.
    pub fn decode(bytes: &[u8]) -> CoreResult<(Self, usize)> {
        let payload_len = parse_header(bytes)?;
        let end = HEADER_LEN + payload_len;
        let total = end + TRAILER_LEN;
        if bytes.len() < total {
            return Err(CoreError::corruption("truncated record envelope"));
        }
        let payload = &bytes[HEADER_LEN..end];
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[end..total]);
        verify_checksum(payload, u32::from_le_bytes(crc))?;
        Ok((Self::decode_payload(payload)?, total))
    }
}

/// Validates an envelope header and returns the payload length.
pub(crate) fn parse_header(bytes: &[u8]) -> CoreResult<usize> {
    if bytes.len() < HEADER_LEN {
        return Err(CoreError::corruption("truncated record header"));
    }
    if bytes[0..4] != RECORD_MAGIC {
        return Err(CoreError::corruption("bad record magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != RECORD_VERSION {
        return Err(CoreError::corruption(format!(
            "unsupported record version {version}"
        )));
    }
    let len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    Ok(len as usize)
}

pub(crate) fn verify_checksum(payload: &[u8], expected: u32) -> CoreResult<()> {
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(CoreError::corruption(format!(
            "checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: u64 = 1_000;

    fn active() -> TxnRecord {
        TxnRecord::begin(Timestamp::new(10), 5_000, false)
    }

    fn commit_at(ts: u64, now: u64) -> Transition {
        Transition::Commit {
            commit_ts: Timestamp::new(ts),
            now,
            timeout_ms: TIMEOUT,
        }
    }

    #[test]
    fn begin_record_is_active_without_commit_ts() {
        let rec = active();
        assert_eq!(rec.id, TransactionId::new(10));
        assert_eq!(rec.state, TxnState::Active);
        assert!(rec.commit_ts.is_none());
        assert!(!rec.is_finished());
    }

    #[test]
    fn commit_sets_timestamp_once() {
        let committed = match active().apply(&commit_at(11, 5_100)) {
            TransitionOutcome::Applied(r) => r,
            other => panic!("expected commit to apply, got {other:?}"),
        };
        assert_eq!(committed.state, TxnState::Committed);
        assert_eq!(committed.commit_ts, Some(Timestamp::new(11)));

        // A second commit is rejected and leaves the timestamp alone.
        let again = committed.apply(&commit_at(12, 5_200));
        assert_eq!(again, TransitionOutcome::Rejected(committed));
    }

    #[test]
    fn commit_after_expiry_is_rejected_as_rolled_back() {
        let outcome = active().apply(&commit_at(11, 5_000 + TIMEOUT + 1));
        match outcome {
            TransitionOutcome::Rejected(r) => {
                assert_eq!(r.state, TxnState::RolledBack);
                assert!(r.commit_ts.is_none());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn rollback_is_idempotent() {
        let rolled = *active().apply(&Transition::Rollback).record();
        assert_eq!(rolled.state, TxnState::RolledBack);
        assert_eq!(
            rolled.apply(&Transition::Rollback),
            TransitionOutcome::Unchanged(rolled)
        );
    }

    #[test]
    fn rollback_of_committed_is_rejected() {
        let committed = *active().apply(&commit_at(11, 5_000)).record();
        assert!(!committed.apply(&Transition::Rollback).is_accepted());
        assert!(!committed.apply(&Transition::Fail).is_accepted());
    }

    #[test]
    fn keep_alive_moves_forward_only() {
        let rec = active();
        let renewed = *rec
            .apply(&Transition::KeepAlive {
                now: 5_500,
                timeout_ms: TIMEOUT,
            })
            .record();
        assert_eq!(renewed.last_keep_alive, 5_500);

        let stale = renewed.apply(&Transition::KeepAlive {
            now: 5_200,
            timeout_ms: TIMEOUT,
        });
        assert_eq!(stale.record().last_keep_alive, 5_500);
    }

    #[test]
    fn keep_alive_cannot_revive_an_expired_record() {
        let outcome = active().apply(&Transition::KeepAlive {
            now: 5_000 + TIMEOUT + 1,
            timeout_ms: TIMEOUT,
        });
        assert_eq!(outcome.record().state, TxnState::RolledBack);
        assert!(!outcome.is_accepted());
    }

    #[test]
    fn abandon_requires_expiry() {
        let rec = active();
        let early = rec.apply(&Transition::Abandon {
            now: 5_000 + TIMEOUT,
            timeout_ms: TIMEOUT,
        });
        assert_eq!(early, TransitionOutcome::Rejected(rec));

        let late = rec.apply(&Transition::Abandon {
            now: 5_000 + TIMEOUT + 1,
            timeout_ms: TIMEOUT,
        });
        assert!(matches!(late, TransitionOutcome::Applied(r) if r.state == TxnState::RolledBack));
    }

    #[test]
    fn status_reports_abandonment() {
        let rec = active();
        assert_eq!(rec.status(5_000 + TIMEOUT, TIMEOUT), TxnStatus::Active);
        assert_eq!(rec.status(5_000 + TIMEOUT + 1, TIMEOUT), TxnStatus::Abandoned);
        assert_eq!(
            TxnStatus::Abandoned.final_status(),
            Some(FinalStatus::RolledBack)
        );
        assert_eq!(TxnStatus::Active.final_status(), None);
    }

    #[test]
    fn envelope_roundtrip() {
        let committed = *active().apply(&commit_at(42, 5_000)).record();
        let bytes = committed.encode();
        let (decoded, used) = TxnRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, committed);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn read_only_flag_survives_encoding() {
        let rec = TxnRecord::begin(Timestamp::new(3), 0, true);
        let decoded = TxnRecord::decode_payload(&rec.encode_payload()).unwrap();
        assert!(decoded.read_only);
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = active().encode();
        bytes[HEADER_LEN + 3] ^= 0x40;
        assert!(matches!(
            TxnRecord::decode(&bytes),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn inconsistent_commit_ts_is_corruption() {
        let mut bogus = active();
        bogus.commit_ts = Some(Timestamp::new(99));
        assert!(TxnRecord::decode_payload(&bogus.encode_payload()).is_err());
    }

    #[test]
    fn truncated_envelope_is_corruption() {
        let bytes = active().encode();
        assert!(TxnRecord::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(TxnRecord::decode(&bytes[..5]).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn transition() -> impl Strategy<Value = Transition> {
            let now = 0u64..20_000;
            prop_oneof![
                (1u64..1_000, now.clone()).prop_map(|(ts, now)| commit_at(ts, now)),
                Just(Transition::Rollback),
                Just(Transition::Fail),
                now.clone().prop_map(|now| Transition::KeepAlive { now, timeout_ms: TIMEOUT }),
                now.prop_map(|now| Transition::Abandon { now, timeout_ms: TIMEOUT }),
            ]
        }

        proptest! {
            #[test]
            fn finished_records_never_change(steps in prop::collection::vec(transition(), 1..24)) {
                let mut rec = active();
                let mut finished: Option<TxnRecord> = None;

                for step in &steps {
                    let next = *rec.apply(step).record();
                    prop_assert!(next.last_keep_alive >= rec.last_keep_alive);
                    prop_assert_eq!(next.commit_ts.is_some(), next.state == TxnState::Committed);
                    if let Some(done) = finished {
                        prop_assert_eq!(next, done);
                    } else if next.is_finished() {
                        finished = Some(next);
                    }
                    rec = next;
                }
            }

            #[test]
            fn applied_commit_keeps_its_timestamp(ts in 1u64..1_000, now in 5_000u64..6_000) {
                let outcome = active().apply(&commit_at(ts, now));
                prop_assert!(matches!(outcome, TransitionOutcome::Applied(_)));
                prop_assert_eq!(outcome.record().commit_ts, Some(Timestamp::new(ts)));
                let decoded = TxnRecord::decode_payload(&outcome.record().encode_payload()).unwrap();
                prop_assert_eq!(decoded, *outcome.record());
            }
        }
    }
}
