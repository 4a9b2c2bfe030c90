//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tierfs_engine::{
    format, BlockDevice, Bpos, BtreeId, Engine, EngineConfig, EngineResult, FormatOptions,
    MemDevice, NoKeyProvider, Record,
};

pub const DEVICE_BYTES: u64 = 64 * 64 * 1024;

pub struct Fixture {
    pub mems: Vec<Arc<MemDevice>>,
    pub devs: Vec<Arc<dyn BlockDevice>>,
}

impl Fixture {
    pub fn new(ndevs: usize, opts: &FormatOptions) -> Self {
        let mems: Vec<Arc<MemDevice>> = (0..ndevs)
            .map(|i| Arc::new(MemDevice::new(format!("mem{i}"), DEVICE_BYTES)))
            .collect();
        let fixture = Self::from_mems(mems);
        format(&fixture.devs, opts, None).unwrap();
        fixture
    }

    pub fn from_mems(mems: Vec<Arc<MemDevice>>) -> Self {
        let devs = mems
            .iter()
            .map(|m| m.clone() as Arc<dyn BlockDevice>)
            .collect();
        Self { mems, devs }
    }

    /// Devices holding the images as they are now, as after a power cut.
    pub fn crash_copy(&self) -> Self {
        let mems = self
            .mems
            .iter()
            .enumerate()
            .map(|(i, m)| Arc::new(MemDevice::from_image(format!("crash{i}"), m.snapshot())))
            .collect();
        Self::from_mems(mems)
    }

    pub fn mount(&self, config: &EngineConfig) -> Engine {
        Engine::mount(&self.devs, config, &NoKeyProvider).unwrap()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn all_records(engine: &Engine, btree: BtreeId) -> Vec<Record> {
    engine
        .iter(btree, ..)
        .collect::<EngineResult<Vec<_>>>()
        .unwrap()
}

pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

pub fn pos(inode: u64) -> Bpos {
    Bpos::new(inode, 0)
}
