mod common;

use std::sync::Arc;
use std::time::Duration;

use cs2dynarec::cache::CacheMeta;
use cs2dynarec::cpu::rv32::asm::*;
use cs2dynarec::dynarec::CodeSign;
use cs2dynarec::{CacheClient, CacheServer, DynarecConfig, ExecContext, MemoryStore, ModuleId};

use common::{cached, image, plain};

fn meta() -> CacheMeta {
    CacheMeta {
        native_size: 16,
        table64_size: 1,
        insts_rsize: 8,
        isize: 4,
        ..Default::default()
    }
}

fn publish_then_lookup(client: &CacheClient) {
    let m = ModuleId::from("m");
    let s1 = CodeSign::compute(&[1; 16]);
    let s2 = CodeSign::compute(&[2; 16]);
    client.attach(std::slice::from_ref(&m)).unwrap();
    client.publish(&m, 0x1000, 16, &s1, &meta(), &[0x5a; 16]);

    let hit = client.lookup(&m, 0x1000, 16, &s1).unwrap().unwrap();
    assert_eq!(hit.meta, meta());
    assert_eq!(hit.code, vec![0x5a; 16]);
    assert!(client.lookup(&m, 0x1000, 16, &s2).unwrap().is_none());
}

#[test]
fn test_signature_keyed_lookup_in_memory() {
    let store = MemoryStore::new();
    publish_then_lookup(&CacheClient::in_memory(&store).with_backoff(Duration::from_millis(1)));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_signature_keyed_lookup_over_tcp() {
    let server = CacheServer::bind("127.0.0.1:0", MemoryStore::new()).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let store = Arc::clone(server.store());
    server.spawn();

    publish_then_lookup(&CacheClient::connect(&addr).unwrap());
    assert_eq!(store.len(), 1);

    // another connection sees the block without attaching first
    let other = CacheClient::connect(&addr).unwrap();
    let m = ModuleId::from("m");
    assert!(other.lookup(&m, 0x1000, 16, &CodeSign::compute(&[1; 16])).unwrap().is_some());
    let mut seen = 0;
    other.preload(&m, |_| seen += 1).unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn test_connect_failure_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    assert!(CacheClient::connect(&addr).is_err());
}

/// Two blocks: a loop closed by bne followed by a call, then straight-line code
fn program() -> Vec<u32> {
    vec![
        addi(1, 1, 1),
        bne(1, 2, -4),
        jal(1, 0x100),
        ret(),
        addi(3, 3, 3),
        add(4, 3, 3),
        ret(),
    ]
}

#[test]
fn test_relocated_module_reuses_cached_block() {
    let store = MemoryStore::new();
    let words = program();

    let first = image(0x1000, &words);
    let d1 = cached(&first, "m", 0, &store, DynarecConfig::default());
    let original = d1.get_or_create(0x1000, 0x1000, true, true).unwrap();
    assert_eq!(original.guest_size(), 16);
    assert_eq!(d1.stats().published, 1);
    assert_eq!(store.len(), 1);

    // same module loaded 0x4000 higher in another process
    let second = image(0x5000, &words);
    let d2 = cached(&second, "m", 0x4000, &store, DynarecConfig::default());
    let hit = d2.get_or_create(0x5000, 0x5000, true, true).unwrap();
    let s = d2.stats();
    assert_eq!((s.cache_hits, s.published), (1, 0));

    // a local compile at the same address produces the same block
    let fresh = plain(&second).get_or_create(0x5000, 0x5000, true, true).unwrap();
    assert_eq!(hit.code(), fresh.code());
    assert_eq!(hit.table64(), fresh.table64());
    assert_eq!(hit.inst_sizes(), fresh.inst_sizes());
    assert_eq!(hit.hash(), fresh.hash());
    assert_eq!(hit.isize(), fresh.isize());
    assert_eq!(hit.jump_targets(), fresh.jump_targets());
    assert_eq!(hit.size(), fresh.size());

    // code is position independent, constants follow the load address
    assert_eq!(hit.code(), original.code());
    assert_ne!(hit.table64(), original.table64());
}

#[test]
fn test_changed_code_misses() {
    let store = MemoryStore::new();
    let words = program();
    let d1 = cached(&image(0x1000, &words), "m", 0, &store, DynarecConfig::default());
    d1.get_or_create(0x1000, 0x1000, true, true).unwrap();

    let mut patched = words.clone();
    patched[0] = addi(1, 1, 2);
    let d2 = cached(&image(0x1000, &patched), "m", 0, &store, DynarecConfig::default());
    d2.get_or_create(0x1000, 0x1000, true, true).unwrap();
    let s = d2.stats();
    assert_eq!((s.cache_hits, s.cache_misses, s.published), (0, 1, 1));
    assert_eq!(store.len(), 2);
}

#[test]
fn test_short_blocks_stay_local() {
    let store = MemoryStore::new();
    let config = DynarecConfig {
        cs2c_mark: 12,
        ..Default::default()
    };
    let d = cached(&image(0x1000, &program()), "m", 0, &store, config);
    // 16 bytes: cached; 12 bytes: not above the mark
    d.get_or_create(0x1000, 0x1000, true, true).unwrap();
    d.get_or_create(0x1010, 0x1010, true, true).unwrap();
    assert_eq!(store.len(), 1);
}

#[test]
fn test_bad_cached_block_is_recompiled() {
    let store = MemoryStore::new();
    let mem = image(0x1000, &[addi(1, 1, 1), ret()]);
    let sign = CodeSign::of_guest(&*mem, 0x1000, 8).unwrap();
    let bogus = CacheMeta {
        native_size: 8,
        table64_size: 0,
        insts_rsize: 8,
        isize: 2,
        ..Default::default()
    };
    let client = CacheClient::in_memory(&store);
    let m = ModuleId::from("m");
    client.attach(std::slice::from_ref(&m)).unwrap();
    client.publish(&m, 0x1000, 8, &sign, &bogus, &[0; 8]);

    let d = cached(&mem, "m", 0, &store, DynarecConfig::default());
    let b = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
    let s = d.stats();
    assert_eq!(s.cache_hits, 1);
    // the retry runs without the cache, so nothing is published over the bad entry
    assert_eq!(s.published, 0);
    assert!(b.is_done());
    assert_eq!(b.code(), plain(&mem).get_or_create(0x1000, 0x1000, true, true).unwrap().code());
}

#[test]
fn test_verification_mode_finds_no_difference() {
    let store = MemoryStore::new();
    let words = program();
    cached(&image(0x1000, &words), "m", 0, &store, DynarecConfig::default())
        .get_or_create(0x1000, 0x1000, true, true)
        .unwrap();

    let config = DynarecConfig {
        cs2c_test: true,
        ..Default::default()
    };
    let d = cached(&image(0x1000, &words), "m", 0, &store, config);
    d.get_or_create(0x1000, 0x1000, true, true).unwrap();
    let s = d.stats();
    assert_eq!((s.cache_hits, s.cache_diffs, s.published), (1, 0, 0));
}

#[test]
fn test_first_request_preloads_module() {
    let store = MemoryStore::new();
    let words = program();
    let d1 = cached(&image(0x1000, &words), "m", 0, &store, DynarecConfig::default());
    d1.get_or_create(0x1000, 0x1000, true, true).unwrap();
    d1.get_or_create(0x1010, 0x1010, true, true).unwrap();
    assert_eq!(store.len(), 2);

    let config = DynarecConfig {
        cs2c_preload: true,
        ..Default::default()
    };
    let d2 = cached(&image(0x9000, &words), "m", 0x8000, &store, config);
    let mut exec = ExecContext::default();
    let b = d2.db_get_block(&mut exec, 0x9010, true, true).unwrap();
    assert!(exec.ready && b.is_done());
    let s = d2.stats();
    assert_eq!(s.preloaded, 2);
    assert_eq!(s.created, 2);
    assert!(d2.get_or_create(0x9000, 0x9000, false, true).is_some());
    assert_eq!(d2.max_db_size(), 16);

    // the module is only preloaded once
    assert!(!d2.preload(0x9000, true));
}

#[test]
fn test_preload_skips_changed_blocks() {
    let store = MemoryStore::new();
    let words = program();
    let d1 = cached(&image(0x1000, &words), "m", 0, &store, DynarecConfig::default());
    d1.get_or_create(0x1000, 0x1000, true, true).unwrap();
    d1.get_or_create(0x1010, 0x1010, true, true).unwrap();

    let mut patched = words.clone();
    patched[5] = add(4, 3, 4);
    let config = DynarecConfig {
        cs2c_preload: true,
        ..Default::default()
    };
    let d2 = cached(&image(0x1000, &patched), "m", 0, &store, config);
    d2.get_or_create(0x1000, 0x1000, true, true).unwrap();
    assert_eq!(d2.stats().preloaded, 1);
    assert!(d2.get_or_create(0x1010, 0x1010, false, true).is_none());
}
