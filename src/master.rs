use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{ensure, Context, Result};

use crate::config::Ptr;

pub const DB_SIG: &[u8] = b"TINYDB_SIG";
pub const MASTER_SIZE: usize = 40;

// The master page occupies the first 40 bytes of the file and commits a
// revision of the store:
//
// | sig | tree_root | page_used | free_head |
// | 16B |    8B     |    8B     |    8B     |
//
// `sig` is the ASCII signature zero-padded to 16 bytes; the integers are
// little-endian.
pub(crate) struct Master {
    pub root: Ptr,
    pub used: u64,
    pub free_head: Ptr,
}

fn signature() -> [u8; 16] {
    let mut sig = [0u8; 16];
    sig[..DB_SIG.len()].copy_from_slice(DB_SIG);
    sig
}

// Validate and decode the master page of a non-empty file.
pub(crate) fn load(data: &[u8], file_pages: u64) -> Result<Master> {
    ensure!(data[..16] == signature(), "bad signature");

    let root = u64::from_le_bytes(data[16..24].try_into().unwrap());
    let used = u64::from_le_bytes(data[24..32].try_into().unwrap());
    let free_head = u64::from_le_bytes(data[32..40].try_into().unwrap());

    ensure!(used >= 1 && used <= file_pages, "bad master page");
    ensure!(root < used, "bad master page");

    Ok(Master {
        root,
        used,
        free_head,
    })
}

// Write the master page with a positional write. Updating it through the
// mapping would not be atomic under a crash; a positional write of less
// than a sector is.
pub(crate) fn store(file: &File, master: &Master) -> Result<()> {
    let mut data = [0u8; MASTER_SIZE];
    data[..16].copy_from_slice(&signature());
    data[16..24].copy_from_slice(&master.root.to_le_bytes());
    data[24..32].copy_from_slice(&master.used.to_le_bytes());
    data[32..40].copy_from_slice(&master.free_head.to_le_bytes());

    file.write_all_at(&data, 0).context("write master page")?;
    Ok(())
}
