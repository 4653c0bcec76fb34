//! Behaviour every registered engine must share

use relaykv::common::utils::MAX_KEY_LEN;
use relaykv::common::{validate_key, ManualClock};
use relaykv::engine::{Engine, EngineOptions, EngineRegistry, WriteInput};
use relaykv::Error;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const START: u64 = 1_700_000_000_000_000_000;

struct Harness {
    engine: Arc<dyn Engine>,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn open(name: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::at_nanos(START));
    let engine = EngineRegistry::with_defaults()
        .open(
            name,
            &EngineOptions::new(dir.path().join(name)).with_clock(clock.clone()),
        )
        .unwrap();
    Harness {
        engine,
        clock,
        _dir: dir,
    }
}

fn engines() -> Vec<String> {
    EngineRegistry::with_defaults().names()
}

fn value(engine: &dyn Engine, key: &str) -> Option<Vec<u8>> {
    let out = engine.read(key.as_bytes()).unwrap();
    if out.exists {
        out.value
    } else {
        None
    }
}

#[test]
fn test_registry_defaults() {
    assert_eq!(engines(), vec!["filesystem", "memory", "sled", "sqlite"]);
}

#[test]
fn test_set_get_delete() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        let out = e.write(&WriteInput::set("alpha", "1")).unwrap();
        assert_eq!(out.value, Some(b"1".to_vec()), "{}", name);
        assert_eq!(value(e, "alpha"), Some(b"1".to_vec()), "{}", name);

        e.write(&WriteInput::set("alpha", "2")).unwrap();
        assert_eq!(value(e, "alpha"), Some(b"2".to_vec()), "{}", name);

        e.write(&WriteInput::delete("alpha")).unwrap();
        assert_eq!(value(e, "alpha"), None, "{}", name);

        // deleting a missing key is not an error
        e.write(&WriteInput::delete("alpha")).unwrap();
        assert!(!e.read(b"missing").unwrap().exists, "{}", name);
    }
}

#[test]
fn test_only_if_not_exists() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        e.write(&WriteInput::set("lock", "a").with_only_if_not_exists())
            .unwrap();
        e.write(&WriteInput::set("lock", "b").with_only_if_not_exists())
            .unwrap();
        assert_eq!(value(e, "lock"), Some(b"a".to_vec()), "{}", name);

        // an expired key no longer blocks the write
        e.write(&WriteInput::set("lease", "old").with_ttl(Duration::from_secs(1)))
            .unwrap();
        h.clock.advance(Duration::from_secs(2));
        e.write(&WriteInput::set("lease", "new").with_only_if_not_exists())
            .unwrap();
        assert_eq!(value(e, "lease"), Some(b"new".to_vec()), "{}", name);
    }
}

#[test]
fn test_ttl_and_keep_ttl() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        e.write(&WriteInput::set("session", "s1").with_ttl(Duration::from_secs(10)))
            .unwrap();
        let out = e.read(b"session").unwrap();
        assert_eq!(out.ttl, Some(Duration::from_secs(10)), "{}", name);

        h.clock.advance(Duration::from_secs(4));
        e.write(&WriteInput::set("session", "s2").with_keep_ttl())
            .unwrap();
        let out = e.read(b"session").unwrap();
        assert_eq!(out.value, Some(b"s2".to_vec()), "{}", name);
        assert_eq!(out.ttl, Some(Duration::from_secs(6)), "{}", name);

        // a plain set clears the expiry
        e.write(&WriteInput::set("session", "s3")).unwrap();
        assert_eq!(e.read(b"session").unwrap().ttl, None, "{}", name);

        e.write(&WriteInput::set("short", "x").with_ttl(Duration::from_millis(500)))
            .unwrap();
        h.clock.advance(Duration::from_millis(500));
        assert_eq!(value(e, "short"), None, "{}", name);
    }
}

#[test]
fn test_increment_and_append() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        let out = e.write(&WriteInput::increment("hits", 5)).unwrap();
        assert_eq!(out.value, Some(b"5".to_vec()), "{}", name);
        e.write(&WriteInput::increment("hits", -2)).unwrap();
        assert_eq!(value(e, "hits"), Some(b"3".to_vec()), "{}", name);

        e.write(&WriteInput::increment("ratio", "0.5")).unwrap();
        e.write(&WriteInput::increment("ratio", "1")).unwrap();
        assert_eq!(value(e, "ratio"), Some(b"1.5".to_vec()), "{}", name);

        e.write(&WriteInput::set("word", "abc")).unwrap();
        assert!(
            matches!(
                e.write(&WriteInput::increment("word", 1)),
                Err(Error::NotANumber(_))
            ),
            "{}",
            name
        );
        assert_eq!(value(e, "word"), Some(b"abc".to_vec()), "{}", name);

        e.write(&WriteInput::append("log", "a")).unwrap();
        let out = e.write(&WriteInput::append("log", "bc")).unwrap();
        assert_eq!(out.value, Some(b"abc".to_vec()), "{}", name);
    }
}

#[test]
fn test_iterate_prefix_in_order() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        for key in ["user/3", "user/1", "order/1", "user/2"] {
            e.write(&WriteInput::set(key, key)).unwrap();
        }
        e.write(&WriteInput::set("user/9", "gone").with_ttl(Duration::from_secs(1)))
            .unwrap();
        h.clock.advance(Duration::from_secs(1));

        let mut keys = Vec::new();
        e.iterate(b"user/", &mut |k: &[u8], _: &[u8]| {
            keys.push(String::from_utf8(k.to_vec()).unwrap());
            true
        })
        .unwrap();
        assert_eq!(keys, vec!["user/1", "user/2", "user/3"], "{}", name);

        let mut first = Vec::new();
        e.iterate(b"", &mut |k: &[u8], _: &[u8]| {
            first.push(k.to_vec());
            false
        })
        .unwrap();
        assert_eq!(first, vec![b"order/1".to_vec()], "{}", name);
    }
}

#[test]
fn test_longest_valid_key() {
    let key = vec![b'k'; MAX_KEY_LEN];
    validate_key(&key).unwrap();

    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();

        e.write(&WriteInput::set(key.clone(), "v")).unwrap();
        e.write(&WriteInput::set("k", "short")).unwrap();
        assert_eq!(e.read(&key).unwrap().value, Some(b"v".to_vec()), "{}", name);

        let mut keys = Vec::new();
        e.iterate(b"kk", &mut |k: &[u8], _: &[u8]| {
            keys.push(k.len());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![MAX_KEY_LEN], "{}", name);

        let mut buf = Vec::new();
        e.export(&mut buf).unwrap();
        let copy = open("memory");
        copy.engine.import(&mut buf.as_slice()).unwrap();
        assert!(copy.engine.read(&key).unwrap().exists, "{}", name);

        e.write(&WriteInput::delete(key.clone())).unwrap();
        assert!(!e.read(&key).unwrap().exists, "{}", name);
    }
}

#[test]
fn test_flush_all() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();
        e.write(&WriteInput::set("a", "1")).unwrap();
        e.write(&WriteInput::set("b", "2").with_ttl(Duration::from_secs(60)))
            .unwrap();
        e.write(&WriteInput::flush_all()).unwrap();

        let mut count = 0;
        e.iterate(b"", &mut |_: &[u8], _: &[u8]| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 0, "{}", name);
    }
}

#[test]
fn test_reaper_removes_expired() {
    for name in engines() {
        let h = open(&name);
        let e = h.engine.as_ref();
        for i in 0..5 {
            e.write(&WriteInput::set(format!("tmp{}", i), "x").with_ttl(Duration::from_secs(1)))
                .unwrap();
        }
        e.write(&WriteInput::set("keep", "x")).unwrap();
        h.clock.advance(Duration::from_secs(2));

        assert_eq!(e.reap_expired(3).unwrap(), 3, "{}", name);
        assert_eq!(e.reap_expired(100).unwrap(), 2, "{}", name);
        assert_eq!(e.reap_expired(100).unwrap(), 0, "{}", name);
        assert_eq!(value(e, "keep"), Some(b"x".to_vec()), "{}", name);
    }
}

#[test]
fn test_dump_moves_between_engines() {
    let names = engines();
    for source in &names {
        for target in &names {
            let src = open(source);
            src.engine.write(&WriteInput::set("k1", "v1")).unwrap();
            src.engine
                .write(&WriteInput::set("k2", "v2").with_ttl(Duration::from_secs(30)))
                .unwrap();
            src.engine
                .write(&WriteInput::set("k3", "v3").with_ttl(Duration::from_secs(1)))
                .unwrap();
            src.clock.advance(Duration::from_secs(1));

            let mut buf = Vec::new();
            let written = src.engine.export(&mut buf).unwrap();
            assert_eq!(written, buf.len() as u64);

            let dst = open(target);
            dst.clock.set_nanos(START + 1_000_000_000);
            let consumed = dst.engine.import(&mut buf.as_slice()).unwrap();
            assert_eq!(consumed, written, "{} -> {}", source, target);

            let e = dst.engine.as_ref();
            assert_eq!(value(e, "k1"), Some(b"v1".to_vec()));
            assert_eq!(
                e.read(b"k2").unwrap().ttl,
                Some(Duration::from_secs(29)),
                "{} -> {}",
                source,
                target
            );
            assert_eq!(value(e, "k3"), None);
        }
    }
}
