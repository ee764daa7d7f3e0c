//! End-to-end chain growth, reorganization and blame scenarios.

mod common;

use common::*;
use curve25519_dalek::Scalar;
use rand::rngs::OsRng;

use veil_chain::store::{state_flags, NodeStore};
use veil_core::block::{BlockBody, Input, Output};
use veil_core::commitment::{CompressedPoint, ScalarBytes};
use veil_core::kernel::{Kernel, KernelData};
use veil_core::proofs::AssetProof;
use veil_core::types::HeightRange;

#[test]
fn single_chain_grows() {
    let mut n = node();
    grow(&mut n, 5, peer(1));
    assert_eq!(n.p.cursor().height, 5);
    assert!(n.p.test_definition());
    assert_eq!(n.log.lock().unwrap().new_state, 5);
}

#[test]
fn txos_before_is_monotonic() {
    let mut n = node();
    grow(&mut n, 4, peer(1));
    let mut prev = 0;
    for h in 1..=5 {
        let t = n.p.get_txos_before(h).unwrap();
        assert!(t >= prev, "txos_before({h}) regressed");
        prev = t;
    }
    // Genesis sees exactly the treasury ids.
    assert_eq!(n.p.get_txos_before(1).unwrap(), n.p.extra().txos_treasury);
}

#[test]
fn chain_work_adds_up() {
    let mut n = node();
    let blocks = grow(&mut n, 4, peer(1));
    let mut prev_work = 0u128;
    for b in &blocks {
        assert_eq!(b.header.chain_work, prev_work + b.header.difficulty.0 as u128);
        prev_work = b.header.chain_work;
    }
}

#[test]
fn spend_a_matured_coinbase() {
    let mut n = node();
    let subsidy = n.p.rules().coinbase_emission;
    let maturity = n.p.rules().coinbase_maturity;

    // Trackable coinbase at height 1.
    let r_coin = Scalar::random(&mut OsRng);
    let offset0 = Scalar::random(&mut OsRng);
    let coin = Output::create(subsidy, &r_coin, true, 0);
    let body0 = BlockBody {
        offset: ScalarBytes::from_scalar(&offset0),
        inputs: vec![],
        outputs: vec![coin.clone()],
        kernels: vec![Kernel::sign(
            &(r_coin - offset0),
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        )],
    };
    let b = make_block(&mut n, &body0);
    feed(&mut n, &b, peer(1));
    n.p.try_go_up().unwrap();

    // Mature it.
    grow(&mut n, maturity as usize, peer(1));

    // Spend it alongside a fresh coinbase.
    let r_cb = Scalar::random(&mut OsRng);
    let r_out = Scalar::random(&mut OsRng);
    let offset = Scalar::random(&mut OsRng);
    let sk = (r_cb + r_out - r_coin) - offset;
    let body = BlockBody {
        offset: ScalarBytes::from_scalar(&offset),
        inputs: vec![Input::new(coin.commitment)],
        outputs: vec![
            Output::create(subsidy, &r_cb, true, 0),
            Output::create(subsidy, &r_out, false, 0),
        ],
        kernels: vec![Kernel::sign(
            &sk,
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        )],
    };
    let b = make_block(&mut n, &body);
    feed(&mut n, &b, peer(1));
    n.p.try_go_up().unwrap();

    assert_eq!(n.p.cursor().height, 2 + maturity);
    assert!(n.p.test_definition());
}

// S1 — reorg across one block: a one-block branch loses to a two-block
// sibling branch with more accumulated work.
#[test]
fn reorg_to_heavier_branch() {
    let mut a = node();
    let mut b1 = node();
    let mut b2 = node();

    // Shared prefix of 3 blocks.
    let shared = grow(&mut b1, 3, peer(1));
    sync_blocks(&mut b2, &shared, peer(1));
    sync_blocks(&mut a, &shared, peer(1));
    assert_eq!(a.p.cursor().height, 3);

    // Branch A: one block on b1.
    let a4 = grow(&mut b1, 1, peer(1)).remove(0);

    // Branch C: two blocks on b2.
    let c = grow(&mut b2, 2, peer(2));

    // A adopts branch A first.
    sync_blocks(&mut a, &[a4.clone()], peer(1));
    assert_eq!(a.p.cursor().id_hash, a4.header.hash());

    // Branch C arrives with more work: reorg.
    sync_blocks(&mut a, &c, peer(2));
    assert_eq!(a.p.cursor().height, 5);
    assert_eq!(a.p.cursor().id_hash, c[1].header.hash());
    assert!(a.p.test_definition());
    assert!(a.log.lock().unwrap().rolled_back >= 1);

    // The losing block is preserved, just not active.
    let row = a.p.store().state_find(&a4.id()).unwrap().expect("a4 kept");
    let flags = a.p.store().get_state_flags(row).unwrap();
    assert_eq!(flags & state_flags::ACTIVE, 0);
    assert_ne!(flags & state_flags::FUNCTIONAL, 0);
}

// Invariant 5 — apply-then-revert leaves the accumulators bit-identical.
#[test]
fn rollback_restores_state() {
    let mut n = node();
    grow(&mut n, 3, peer(1));

    let root = n.p.utxos_root();
    let extra = *n.p.extra();
    let id_hash = n.p.cursor().id_hash;

    grow(&mut n, 2, peer(1));
    assert_ne!(n.p.utxos_root(), root);

    n.p.rollback_to(3).unwrap();
    assert_eq!(n.p.cursor().height, 3);
    assert_eq!(n.p.cursor().id_hash, id_hash);
    assert_eq!(n.p.utxos_root(), root);
    assert_eq!(*n.p.extra(), extra);
    assert!(n.p.test_definition());
}

#[test]
fn invalid_block_blames_peer() {
    let mut n = node();
    let mut builder = node();
    let shared = grow(&mut builder, 2, peer(1));
    sync_blocks(&mut n, &shared, peer(1));

    // A block whose body spends a non-existent UTXO: the header is fine
    // (the kernel commitment does not cover inputs), the context is not.
    let subsidy = n.p.rules().coinbase_emission;
    let body = coinbase_body(subsidy);
    let block = make_block(&mut builder, &body);

    let mut bad = veil_core::block::BlockBody::from_parts(&block.perishable, &block.eternal).unwrap();
    let bogus = CompressedPoint::from_point(
        &(veil_core::commitment::generator_g() * Scalar::from(123456u64)),
    );
    bad.inputs.push(Input::new(bogus));
    let (p, e) = bad.serialize_parts();
    let tampered = TestBlock { header: block.header.clone(), perishable: p, eternal: e };

    let evil = peer(66);
    feed(&mut n, &tampered, evil);
    n.p.try_go_up().unwrap();

    // Cursor unmoved, peer blamed, block data discarded.
    assert_eq!(n.p.cursor().height, 2);
    assert_eq!(n.log.lock().unwrap().insane, vec![evil]);
    let row = n.p.store().state_find(&tampered.id()).unwrap().unwrap();
    assert_eq!(
        n.p.store().get_state_flags(row).unwrap() & state_flags::FUNCTIONAL,
        0
    );

    // The honest version of the block is still acceptable afterwards.
    feed(&mut n, &block, peer(1));
    n.p.try_go_up().unwrap();
    assert_eq!(n.p.cursor().height, 3);
}

#[test]
fn mempool_context_validation_leaves_no_trace() {
    let mut n = node();
    let subsidy = n.p.rules().coinbase_emission;
    let maturity = n.p.rules().coinbase_maturity;

    // A tracked coinbase, matured.
    let r_coin = Scalar::random(&mut OsRng);
    let offset0 = Scalar::random(&mut OsRng);
    let coin = Output::create(subsidy, &r_coin, true, 0);
    let body0 = BlockBody {
        offset: ScalarBytes::from_scalar(&offset0),
        inputs: vec![],
        outputs: vec![coin.clone()],
        kernels: vec![Kernel::sign(
            &(r_coin - offset0),
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        )],
    };
    let b = make_block(&mut n, &body0);
    feed(&mut n, &b, peer(1));
    n.p.try_go_up().unwrap();
    grow(&mut n, maturity as usize, peer(1));

    let root = n.p.utxos_root();

    // A fee-paying spend of the coin validates in context.
    let r_out = Scalar::random(&mut OsRng);
    let offset = Scalar::random(&mut OsRng);
    let tx = BlockBody {
        offset: ScalarBytes::from_scalar(&offset),
        inputs: vec![Input::new(coin.commitment)],
        outputs: vec![Output::create(subsidy - 10, &r_out, false, 0)],
        kernels: vec![Kernel::sign(
            &(r_out - r_coin - offset),
            10,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        )],
    };
    n.p.validate_tx_context(&tx).unwrap();
    assert_eq!(n.p.utxos_root(), root, "validation must leave no trace");

    // Spending an unknown UTXO is invalid.
    let bogus = CompressedPoint::from_point(
        &(veil_core::commitment::generator_g() * Scalar::from(55u64)),
    );
    let mut bad = tx.clone();
    bad.inputs.push(Input::new(bogus));
    assert!(matches!(
        n.p.validate_tx_context(&bad),
        Err(veil_chain::error::ApplyError::Invalid)
    ));
    assert_eq!(n.p.utxos_root(), root);
}

#[test]
fn asset_emission_balances_end_to_end() {
    let mut n = node();
    let subsidy = n.p.rules().coinbase_emission;
    let owner_sk = Scalar::from(4242u64);
    let owner = CompressedPoint::from_point(&(veil_core::commitment::generator_g() * owner_sk));

    // Block 1: coinbase + asset registration.
    let r_cb = Scalar::random(&mut OsRng);
    let offset = Scalar::random(&mut OsRng);
    let sk_create = Scalar::from(7u64);
    let sk_cb = r_cb - offset - sk_create;
    let mut kernels = vec![
        Kernel::sign(
            &sk_cb,
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        ),
        Kernel::sign(
            &sk_create,
            0,
            HeightRange::unbounded(),
            KernelData::AssetCreate { owner, metadata: b"veil-test-asset".to_vec() },
            vec![],
        ),
    ];
    kernels.sort_by_key(|k| k.id());
    let body1 = BlockBody {
        offset: ScalarBytes::from_scalar(&offset),
        inputs: vec![],
        outputs: vec![Output::create(subsidy, &r_cb, true, 0)],
        kernels,
    };
    let b1 = make_block(&mut n, &body1);
    feed(&mut n, &b1, peer(1));
    n.p.try_go_up().unwrap();
    assert_eq!(n.p.store().asset_get(1).unwrap().unwrap().owner, owner);

    // Block 2: coinbase + emit 500 units of asset 1 into an asset output.
    let value = 500i64;
    let t = Scalar::random(&mut OsRng); // generator blinding
    let r_asset = Scalar::random(&mut OsRng);
    let asset_out = Output::create_asset(
        value as u64,
        &r_asset,
        AssetProof::create(1, 1, 1, &t),
        0,
    );

    let r_cb2 = Scalar::random(&mut OsRng);
    let offset2 = Scalar::random(&mut OsRng);
    let sk_emit = Scalar::from(9u64);
    // The blinded generator leaks value·t onto G; the main kernel absorbs it.
    let sk_cb2 = r_cb2 + r_asset + Scalar::from(value as u64) * t - offset2 - sk_emit;
    let mut kernels = vec![
        Kernel::sign(
            &sk_cb2,
            0,
            HeightRange::unbounded(),
            KernelData::Std { relative_lock: None },
            vec![],
        ),
        Kernel::sign(
            &sk_emit,
            0,
            HeightRange::unbounded(),
            KernelData::AssetEmit { asset_id: 1, owner, amount: value },
            vec![],
        ),
    ];
    kernels.sort_by_key(|k| k.id());
    let body2 = BlockBody {
        offset: ScalarBytes::from_scalar(&offset2),
        inputs: vec![],
        outputs: vec![Output::create(subsidy, &r_cb2, true, 0), asset_out],
        kernels,
    };
    let b2 = make_block(&mut n, &body2);
    feed(&mut n, &b2, peer(1));
    n.p.try_go_up().unwrap();

    assert_eq!(n.p.cursor().height, 2);
    assert!(n.p.test_definition());
    let info = n.p.store().asset_get(1).unwrap().unwrap();
    assert_eq!(info.value, 500);
    assert_eq!(info.lock_height, 2);
}
