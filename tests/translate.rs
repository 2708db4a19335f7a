use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use cs2dynarec::cpu::rv32::asm::*;
use cs2dynarec::{CacheServer, MemoryStore};

const ENV: [&str; 10] = [
    "DYNAREC_WAIT",
    "DYNAREC_BIGBLOCK",
    "DYNAREC_MAX_INSTS",
    "DYNAREC_NODYNAREC",
    "DYNAREC_DUMP",
    "CS2C",
    "CS2C_MARK",
    "CS2C_PRELOAD",
    "CS2C_TEST",
    "CS2C_SERVER",
];

/// Entry block branching to two exits, each a block of its own
fn write_image(dir: &Path) -> std::path::PathBuf {
    let raw = assemble(&[addi(1, 1, 1), beq(1, 2, 12), jal(0, 12), nop(), addi(2, 2, 2), ret()]);
    let path = dir.join("guest.zst");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&zstd::stream::encode_all(&raw[..], 3).unwrap()).unwrap();
    path
}

fn translate(image: &Path, extra: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cs2dynarec"));
    for var in ENV {
        cmd.env_remove(var);
    }
    cmd.arg("translate")
        .arg(image)
        .args(["--base", "0x10000", "--module", "guest"])
        .args(extra);
    let out = cmd.output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    out
}

#[test]
fn test_translates_reachable_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path());
    let out = translate(&image, &[]);
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("created=3 "), "{stdout}");
    assert!(stdout.contains("aborted=0"), "{stdout}");
}

#[test]
fn test_second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path());
    let server = CacheServer::bind("127.0.0.1:0", MemoryStore::new()).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let store = std::sync::Arc::clone(server.store());
    server.spawn();

    let first = String::from_utf8(translate(&image, &["--cache", &addr]).stdout).unwrap();
    assert!(first.contains("hits=0 misses=3 published=3"), "{first}");
    assert_eq!(store.len(), 3);

    let second = String::from_utf8(translate(&image, &["--cache", &addr]).stdout).unwrap();
    assert!(second.contains("created=3 "), "{second}");
    assert!(second.contains("hits=3 misses=0 published=0"), "{second}");
}

#[test]
fn test_missing_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_cs2dynarec"))
        .arg("translate")
        .arg(dir.path().join("absent.bin"))
        .output()
        .unwrap();
    assert!(!out.status.success());
}
