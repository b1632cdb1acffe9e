//! Shared fixtures for module tests: a freshly initialized volume on a
//! temp file with the block layer and list allocator wired up the way the
//! server wires them at startup.

use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::alloc::MetaAlloc;
use crate::block::BlockLayer;
use crate::format::{mkfs, MkfsParams, SuperBlock};

pub(crate) struct TestVol {
    pub _dir: tempfile::TempDir,
    pub path: PathBuf,
    pub sup: SuperBlock,
    pub block: BlockLayer,
    pub meta: MetaAlloc,
}

impl TestVol {
    /// A second block layer over the same device with a cold cache.
    pub fn reopen(&self) -> BlockLayer {
        let dev = OpenOptions::new().read(true).write(true).open(&self.path).unwrap();
        BlockLayer::new(dev, self.sup.hdr.fsid, self.block.dirty_seq(), self.sup.total_meta_blocks)
    }
}

pub(crate) fn open_vol() -> TestVol {
    open_vol_sized(4096, 16384)
}

pub(crate) fn open_vol_sized(meta_blocks: u64, data_blocks: u64) -> TestVol {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol");
    let sup = mkfs(&path, MkfsParams { meta_blocks, data_blocks }).unwrap();
    let dev = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let block = BlockLayer::new(dev, sup.hdr.fsid, sup.hdr.seq + 1, sup.total_meta_blocks);
    let meta = MetaAlloc::new();
    meta.load_bank(&sup.server_meta_avail[0], &sup.server_meta_freed[0]);
    TestVol { _dir: dir, path, sup, block, meta }
}
