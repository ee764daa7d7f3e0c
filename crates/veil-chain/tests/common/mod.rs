//! Shared scenario-test harness: an in-memory node with a recording event
//! sink, plus block builders that produce fully valid chains.
#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::{Arc, Mutex};

use curve25519_dalek::Scalar;
use rand::rngs::OsRng;

use veil_chain::error::DataStatus;
use veil_chain::processor::{
    mine_header, Processor, ProcessorConfig, ProcessorEvents,
};
use veil_chain::store::MemStore;
use veil_core::block::{BlockBody, Output};
use veil_core::commitment::ScalarBytes;
use veil_core::kernel::{Kernel, KernelData};
use veil_core::types::{BlockHeader, Height, HeightRange, PeerId, StateId};

#[derive(Default)]
pub struct EventLog {
    pub requests: Vec<(StateId, bool)>,
    pub insane: Vec<PeerId>,
    pub new_state: usize,
    pub rolled_back: usize,
    pub fast_sync_over: usize,
}

pub struct Recorder(pub Arc<Mutex<EventLog>>);

impl ProcessorEvents for Recorder {
    fn request_data(&mut self, id: StateId, is_block: bool, _target: StateId) {
        self.0.lock().unwrap().requests.push((id, is_block));
    }
    fn on_peer_insane(&mut self, peer: PeerId) {
        self.0.lock().unwrap().insane.push(peer);
    }
    fn on_new_state(&mut self) {
        self.0.lock().unwrap().new_state += 1;
    }
    fn on_rolled_back(&mut self) {
        self.0.lock().unwrap().rolled_back += 1;
    }
    fn on_fast_sync_over(&mut self) {
        self.0.lock().unwrap().fast_sync_over += 1;
    }
}

pub struct TestNode {
    pub p: Processor<MemStore>,
    pub log: Arc<Mutex<EventLog>>,
}

pub fn node() -> TestNode {
    node_with(ProcessorConfig::for_tests())
}

pub fn node_with(config: ProcessorConfig) -> TestNode {
    node_on(MemStore::new(), config)
}

/// Open a node over an existing store (restart simulation).
pub fn node_on(store: MemStore, config: ProcessorConfig) -> TestNode {
    let log = Arc::new(Mutex::new(EventLog::default()));
    let p = Processor::initialize(store, Box::new(Recorder(Arc::clone(&log))), config).unwrap();
    TestNode { p, log }
}

/// A mined block ready to feed into a node.
#[derive(Clone)]
pub struct TestBlock {
    pub header: BlockHeader,
    pub perishable: Vec<u8>,
    pub eternal: Vec<u8>,
}

impl TestBlock {
    pub fn id(&self) -> StateId {
        self.header.id()
    }
}

/// A coinbase-only body paying the full emission to a fresh key.
pub fn coinbase_body(subsidy: u64) -> BlockBody {
    let r = Scalar::random(&mut OsRng);
    let offset = Scalar::random(&mut OsRng);
    let sk = r - offset;
    BlockBody {
        offset: ScalarBytes::from_scalar(&offset),
        inputs: vec![],
        outputs: vec![Output::create(subsidy, &r, true, 0)],
        kernels: vec![Kernel::sign(
            &sk,
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        )],
    }
}

/// Assemble and mine `body` on top of `node`'s cursor.
pub fn make_block(node: &mut TestNode, body: &BlockBody) -> TestBlock {
    let ts = node
        .p
        .cursor()
        .full
        .as_ref()
        .map(|f| f.timestamp + 60)
        .unwrap_or(1_000_000);
    let (mut header, perishable, eternal) = node.p.generate_block(body, ts).unwrap();
    assert!(mine_header(&mut header, u64::MAX));
    TestBlock { header, perishable, eternal }
}

/// Deliver header and body; both must be accepted (or the header already
/// known).
pub fn feed(node: &mut TestNode, block: &TestBlock, peer: PeerId) {
    let st = node.p.on_state(&block.header, peer).unwrap();
    assert!(
        matches!(st, DataStatus::Accepted | DataStatus::Rejected),
        "header status {st:?}"
    );
    let st = node
        .p
        .on_block(&block.id(), &block.perishable, &block.eternal, peer)
        .unwrap();
    assert_eq!(st, DataStatus::Accepted, "body status");
}

/// Grow `node` by `count` coinbase blocks, applying each one.
pub fn grow(node: &mut TestNode, count: usize, peer: PeerId) -> Vec<TestBlock> {
    let subsidy = node.p.rules().coinbase_emission;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let body = coinbase_body(subsidy);
        let block = make_block(node, &body);
        feed(node, &block, peer);
        node.p.try_go_up().unwrap();
        out.push(block);
    }
    out
}

/// Feed pre-built blocks to another node and let it catch up.
pub fn sync_blocks(node: &mut TestNode, blocks: &[TestBlock], peer: PeerId) {
    for block in blocks {
        feed(node, block, peer);
    }
    node.p.try_go_up().unwrap();
}

/// Feed headers only.
pub fn sync_headers(node: &mut TestNode, blocks: &[TestBlock], peer: PeerId) {
    for block in blocks {
        let st = node.p.on_state(&block.header, peer).unwrap();
        assert_eq!(st, DataStatus::Accepted);
    }
}

pub fn peer(byte: u8) -> PeerId {
    PeerId([byte; 32])
}

#[allow(dead_code)]
pub fn height_of(node: &TestNode) -> Height {
    node.p.cursor().height
}
