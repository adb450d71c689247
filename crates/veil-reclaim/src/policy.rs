//! Reuse eligibility: when is a per-block accounting record provably safe
//! to recycle?
//!
//! Being wrong here silently corrupts a snapshot, so every clause is a hard
//! requirement; the predicate is pure and takes the caller-supplied
//! snapshot/generation view as an argument.

use veil_types::SnapshotView;

use crate::codec::LeafRecord;
use crate::request::RekeyState;

/// Whether `record` may be reclaimed.
///
/// All of the following must hold:
/// 1. the tracked address is real (not null, not the invalid sentinel);
/// 2. the release is durable: `free_gen <= last_secured`, so reclaiming it
///    cannot be undone by recovery;
/// 3. the record is not reserved, or it is reserved but stale with respect
///    to the in-progress key rotation (previous key, last-owning VBA
///    strictly before the cursor);
/// 4. no valid snapshot depends on the block: a version that already
///    existed when snapshot `S` was taken (`alloc_gen < S + 1`) and was
///    freed only afterward (`free_gen > S`) is still visible to `S`.
#[must_use]
pub fn is_eligible(record: &LeafRecord, rekey: &RekeyState, view: &SnapshotView<'_>) -> bool {
    if !record.pba.is_valid() {
        return false;
    }

    if record.free_gen > view.last_secured {
        return false;
    }

    if record.reserved {
        let stale = rekey.active
            && record.key_id == rekey.prev_key
            && record.last_vba < rekey.cursor;
        if !stale {
            return false;
        }
    }

    view.snapshots.iter().all(|snapshot| {
        !(record.free_gen > *snapshot && record.alloc_gen <= *snapshot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{Generation, KeyId, Pba, Vba};

    fn record() -> LeafRecord {
        LeafRecord {
            pba: Pba(100),
            alloc_gen: Generation(5),
            free_gen: Generation(10),
            last_vba: Vba(40),
            key_id: KeyId(1),
            reserved: false,
        }
    }

    fn rekey_active() -> RekeyState {
        RekeyState {
            active: true,
            prev_key: KeyId(1),
            current_key: KeyId(2),
            cursor: Vba(50),
            highest: Vba(1000),
        }
    }

    #[test]
    fn plain_released_record_is_eligible() {
        let view = SnapshotView::new(&[], Generation(12));
        assert!(is_eligible(&record(), &RekeyState::inactive(KeyId(2)), &view));
    }

    #[test]
    fn sentinel_addresses_are_never_eligible() {
        let view = SnapshotView::new(&[], Generation(u64::MAX));
        let rekey = RekeyState::inactive(KeyId(2));
        let mut rec = record();
        rec.pba = Pba::NULL;
        assert!(!is_eligible(&rec, &rekey, &view));
        rec.pba = Pba::INVALID;
        assert!(!is_eligible(&rec, &rekey, &view));
    }

    #[test]
    fn unsecured_release_is_not_eligible() {
        let rekey = RekeyState::inactive(KeyId(2));
        // free_gen = 10 > last_secured = 9: the release could be rolled back.
        let view = SnapshotView::new(&[], Generation(9));
        assert!(!is_eligible(&record(), &rekey, &view));
        let view = SnapshotView::new(&[], Generation(10));
        assert!(is_eligible(&record(), &rekey, &view));
    }

    #[test]
    fn reserved_record_is_held_unless_rekey_stale() {
        let view = SnapshotView::new(&[], Generation(12));
        let mut rec = record();
        rec.reserved = true;

        // No rotation running: reserved means held.
        assert!(!is_eligible(&rec, &RekeyState::inactive(KeyId(2)), &view));

        // Previous key, last VBA 40 < cursor 50: stale, reclaimable.
        assert!(is_eligible(&rec, &rekey_active(), &view));

        // Already on the current key: genuinely held.
        rec.key_id = KeyId(2);
        assert!(!is_eligible(&rec, &rekey_active(), &view));

        // At or past the cursor: the rotation has not passed it yet.
        rec.key_id = KeyId(1);
        rec.last_vba = Vba(50);
        assert!(!is_eligible(&rec, &rekey_active(), &view));
    }

    #[test]
    fn snapshot_protection_excludes_live_versions() {
        // Spec scenario D: alloc_gen=5, free_gen=10, snapshot at 7,
        // last_secured=12. The block existed at the snapshot (5 < 8) and was
        // freed after it (10 > 7), so the snapshot still sees it.
        let snapshots = [Generation(7)];
        let view = SnapshotView::new(&snapshots, Generation(12));
        let rekey = RekeyState::inactive(KeyId(2));
        assert!(!is_eligible(&record(), &rekey, &view));

        // A snapshot taken after the release does not pin it.
        let snapshots = [Generation(11)];
        let view = SnapshotView::new(&snapshots, Generation(12));
        assert!(is_eligible(&record(), &rekey, &view));

        // A block allocated after the snapshot was never visible to it.
        let snapshots = [Generation(7)];
        let view = SnapshotView::new(&snapshots, Generation(12));
        let mut rec = record();
        rec.alloc_gen = Generation(8);
        assert!(is_eligible(&rec, &rekey, &view));

        // Any one protecting snapshot suffices to exclude.
        let snapshots = [Generation(11), Generation(7)];
        let view = SnapshotView::new(&snapshots, Generation(12));
        assert!(!is_eligible(&record(), &rekey, &view));
    }
}
