//! On-disk node block codec.
//!
//! Inner blocks hold `degree` child entries of [`INNER_ENTRY_SIZE`] bytes;
//! leaf blocks hold `leaf_slots` accounting records of [`LEAF_RECORD_SIZE`]
//! bytes. Entries are packed little-endian from offset 0 and the remainder
//! of the block is zero. Digests cover the whole image, padding included.

use veil_error::{Fault, Result};
use veil_types::{
    read_fixed, read_le_u32, read_le_u64, write_fixed, write_le_u32, write_le_u64, Digest,
    Generation, KeyId, ParseError, Pba, Vba, DIGEST_SIZE,
};

use crate::request::NodeRef;

/// Bytes per inner-node child entry: pba, generation, digest.
pub const INNER_ENTRY_SIZE: usize = 8 + 8 + DIGEST_SIZE;

/// Bytes per leaf accounting record.
pub const LEAF_RECORD_SIZE: usize = 40;

const FLAG_RESERVED: u32 = 1;

/// Per-physical-block accounting record, the leaf of the free tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRecord {
    /// The tracked physical block. `Pba::NULL` marks a vacant record.
    pub pba: Pba,
    /// Generation the block was allocated in.
    pub alloc_gen: Generation,
    /// Generation the block was released in.
    pub free_gen: Generation,
    /// Lowest VBA of the tree position that last owned the block.
    pub last_vba: Vba,
    /// Key the last owner was encrypted under.
    pub key_id: KeyId,
    /// Set while the block is held by a live allocation.
    pub reserved: bool,
}

fn fault(pba: Pba, err: &ParseError) -> Fault {
    Fault::MalformedBlock {
        pba: pba.0,
        detail: err.to_string(),
    }
}

/// Decode child entry `idx` of the inner block at `pba`.
pub fn inner_child(block: &[u8], pba: Pba, idx: u32) -> Result<NodeRef> {
    let offset = idx as usize * INNER_ENTRY_SIZE;
    let child = Pba(read_le_u64(block, offset).map_err(|e| fault(pba, &e))?);
    let gen = Generation(read_le_u64(block, offset + 8).map_err(|e| fault(pba, &e))?);
    let digest = Digest(read_fixed::<DIGEST_SIZE>(block, offset + 16).map_err(|e| fault(pba, &e))?);
    Ok(NodeRef {
        pba: child,
        gen,
        digest,
    })
}

/// Overwrite child entry `idx` of the inner block at `pba`.
pub fn set_inner_child(block: &mut [u8], pba: Pba, idx: u32, child: &NodeRef) -> Result<()> {
    let offset = idx as usize * INNER_ENTRY_SIZE;
    write_le_u64(block, offset, child.pba.0).map_err(|e| fault(pba, &e))?;
    write_le_u64(block, offset + 8, child.gen.0).map_err(|e| fault(pba, &e))?;
    write_fixed(block, offset + 16, &child.digest.0).map_err(|e| fault(pba, &e))?;
    Ok(())
}

/// Decode record `slot` of the leaf block at `pba`.
pub fn leaf_record(block: &[u8], pba: Pba, slot: u32) -> Result<LeafRecord> {
    let offset = slot as usize * LEAF_RECORD_SIZE;
    let record = Pba(read_le_u64(block, offset).map_err(|e| fault(pba, &e))?);
    let alloc_gen = Generation(read_le_u64(block, offset + 8).map_err(|e| fault(pba, &e))?);
    let free_gen = Generation(read_le_u64(block, offset + 16).map_err(|e| fault(pba, &e))?);
    let last_vba = Vba(read_le_u64(block, offset + 24).map_err(|e| fault(pba, &e))?);
    let key_id = KeyId(read_le_u32(block, offset + 32).map_err(|e| fault(pba, &e))?);
    let flags = read_le_u32(block, offset + 36).map_err(|e| fault(pba, &e))?;
    Ok(LeafRecord {
        pba: record,
        alloc_gen,
        free_gen,
        last_vba,
        key_id,
        reserved: flags & FLAG_RESERVED != 0,
    })
}

/// Overwrite record `slot` of the leaf block at `pba`.
pub fn set_leaf_record(block: &mut [u8], pba: Pba, slot: u32, record: &LeafRecord) -> Result<()> {
    let offset = slot as usize * LEAF_RECORD_SIZE;
    write_le_u64(block, offset, record.pba.0).map_err(|e| fault(pba, &e))?;
    write_le_u64(block, offset + 8, record.alloc_gen.0).map_err(|e| fault(pba, &e))?;
    write_le_u64(block, offset + 16, record.free_gen.0).map_err(|e| fault(pba, &e))?;
    write_le_u64(block, offset + 24, record.last_vba.0).map_err(|e| fault(pba, &e))?;
    write_le_u32(block, offset + 32, record.key_id.0).map_err(|e| fault(pba, &e))?;
    let flags = if record.reserved { FLAG_RESERVED } else { 0 };
    write_le_u32(block, offset + 36, flags).map_err(|e| fault(pba, &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_record_round_trip() {
        let mut block = vec![0_u8; 4096];
        let record = LeafRecord {
            pba: Pba(0xDEAD_BEEF),
            alloc_gen: Generation(12),
            free_gen: Generation(15),
            last_vba: Vba(777),
            key_id: KeyId(3),
            reserved: true,
        };
        set_leaf_record(&mut block, Pba(1), 5, &record).expect("encode");
        assert_eq!(leaf_record(&block, Pba(1), 5).expect("decode"), record);

        // Untouched slots stay vacant.
        let vacant = leaf_record(&block, Pba(1), 4).expect("decode");
        assert_eq!(vacant.pba, Pba::NULL);
        assert!(!vacant.reserved);
    }

    #[test]
    fn inner_child_round_trip() {
        let mut block = vec![0_u8; 4096];
        let child = NodeRef {
            pba: Pba(42),
            gen: Generation(9),
            digest: Digest([0xAB; DIGEST_SIZE]),
        };
        set_inner_child(&mut block, Pba(2), 3, &child).expect("encode");
        assert_eq!(inner_child(&block, Pba(2), 3).expect("decode"), child);
    }

    #[test]
    fn out_of_range_slot_is_a_malformed_block() {
        let block = vec![0_u8; 64];
        let err = leaf_record(&block, Pba(7), 2).unwrap_err();
        assert!(matches!(err, Fault::MalformedBlock { pba: 7, .. }));
        assert!(inner_child(&block, Pba(7), 2).is_err());
    }

    #[test]
    fn reserved_flag_is_bit_zero() {
        let mut block = vec![0_u8; 256];
        let mut record = LeafRecord {
            pba: Pba(1),
            alloc_gen: Generation(1),
            free_gen: Generation(1),
            last_vba: Vba(0),
            key_id: KeyId(0),
            reserved: false,
        };
        set_leaf_record(&mut block, Pba(1), 0, &record).expect("encode");
        assert_eq!(read_le_u32(&block, 36).expect("flags"), 0);

        record.reserved = true;
        set_leaf_record(&mut block, Pba(1), 0, &record).expect("encode");
        assert_eq!(read_le_u32(&block, 36).expect("flags"), 1);
    }
}
