//! S6 — UTXO image staleness after a crash between the store commit and
//! the image flush: the stamp mismatch forces a rebuild from the txos
//! table, verified against the cursor's definition.

mod common;

use common::*;

use veil_chain::processor::ProcessorConfig;
use veil_core::types::Hash256;

fn config_with_image(path: &std::path::Path) -> ProcessorConfig {
    let mut config = ProcessorConfig::for_tests();
    config.utxo_image_path = Some(path.to_path_buf());
    config
}

#[test]
fn stale_image_is_discarded_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("node-utxo-image.bin");
    let stale_copy = dir.path().join("stale.bin");

    let mut n = node_on(veil_chain::store::MemStore::new(), config_with_image(&image));
    grow(&mut n, 3, peer(1));
    assert!(image.exists());

    // Keep a copy of the image as of height 3, then advance to 4.
    std::fs::copy(&image, &stale_copy).unwrap();
    grow(&mut n, 1, peer(1));
    let tip = n.p.cursor().id_hash;
    let root = n.p.utxos_root();

    // "Crash": the store committed height 4 but the image on disk is the
    // height-3 one.
    let store = n.p.into_store();
    std::fs::copy(&stale_copy, &image).unwrap();

    let mut n = node_on(store, config_with_image(&image));
    assert_eq!(n.p.cursor().height, 4);
    assert_eq!(n.p.cursor().id_hash, tip);
    assert_eq!(n.p.utxos_root(), root);
    assert!(n.p.test_definition());
}

#[test]
fn intact_image_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("node-utxo-image.bin");

    let mut n = node_on(veil_chain::store::MemStore::new(), config_with_image(&image));
    grow(&mut n, 4, peer(1));
    let root = n.p.utxos_root();
    let store = n.p.into_store();

    let mut n = node_on(store, config_with_image(&image));
    assert_eq!(n.p.cursor().height, 4);
    assert_eq!(n.p.utxos_root(), root);
    assert_ne!(n.p.utxos_root(), Hash256::ZERO);
}

#[test]
fn garbage_image_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("node-utxo-image.bin");

    let mut n = node_on(veil_chain::store::MemStore::new(), config_with_image(&image));
    grow(&mut n, 2, peer(1));
    let root = n.p.utxos_root();
    let store = n.p.into_store();

    std::fs::write(&image, b"not an image").unwrap();

    let mut n = node_on(store, config_with_image(&image));
    assert_eq!(n.p.utxos_root(), root);
    assert!(n.p.test_definition());
}
