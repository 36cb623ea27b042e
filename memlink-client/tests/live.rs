//! Tests against a real memcached on localhost:11211.
//!
//! Run with `cargo test -p memlink-client --test live -- --ignored` while a
//! server is listening. The cache is flushed at the start of each test.

use std::time::Duration;

use memlink_client::{Client, ClientConfig, Item, McError};

const LOCAL_ADDR: &str = "127.0.0.1:11211";

fn live_client() -> Client {
    let config = ClientConfig {
        timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    };
    let client = Client::with_config(&[LOCAL_ADDR], config).expect("client");
    client.ping().expect("memcached must be running on localhost:11211");
    client.flush(0).expect("flush");
    client
}

#[test]
#[ignore = "requires memcached on localhost:11211"]
fn live_storage_and_retrieval() {
    let client = live_client();

    let foo = Item::new("foo", "fooval").with_flags(123);
    client.set(&foo).expect("set");
    let item = client.get("foo").expect("get");
    assert_eq!(item.value, b"fooval");
    assert_eq!(item.flags, 123);

    let bar = Item::new("bar", "barval");
    client.add(&bar).expect("add");
    assert!(matches!(client.add(&bar), Err(McError::NotStored)));
    assert!(matches!(
        client.replace(&Item::new("baz", "x")),
        Err(McError::NotStored)
    ));

    let found = client.get_multi(&["foo", "bar", "nope"]).expect("get multi");
    assert_eq!(found.len(), 2);

    client
        .set_multi(&[Item::new("baz1", "1"), Item::new("baz2", "2").with_flags(7)])
        .expect("set multi");
    assert_eq!(client.get("baz2").expect("get").flags, 7);

    client.delete_multi(&["baz1", "baz2", "nope"]).expect("delete multi");
    assert!(matches!(client.get("baz1"), Err(McError::CacheMiss)));
}

#[test]
#[ignore = "requires memcached on localhost:11211"]
fn live_counters_and_cas() {
    let client = live_client();

    client.set(&Item::new("num", "42")).expect("set");
    assert_eq!(client.increment("num", 8).expect("incr"), 50);
    assert_eq!(client.decrement("num", 49).expect("decr"), 1);
    assert_eq!(client.decrement("num", 10).expect("decr"), 0);
    client.delete("num").expect("delete");
    assert!(matches!(client.increment("num", 1), Err(McError::CacheMiss)));

    client.set(&Item::new("word", "abc")).expect("set");
    assert!(matches!(client.increment("word", 1), Err(McError::BadIncrDec)));

    let mut item = client.get("word").expect("get");
    let stale = item.clone();
    item.value = b"def".to_vec();
    client.compare_and_swap(&item).expect("cas");
    assert!(matches!(client.compare_and_swap(&stale), Err(McError::CasConflict)));
}

#[test]
#[ignore = "requires memcached on localhost:11211"]
fn live_quiet_writes_and_touch() {
    let client = live_client();

    client.set_quietly(&Item::new("quiet", "Shhh")).expect("set quietly");
    assert_eq!(client.get("quiet").expect("get").value, b"Shhh");

    client.touch("quiet", 60).expect("touch");
    client.delete_quietly("quiet").expect("delete quietly");
    assert!(matches!(client.get("quiet"), Err(McError::CacheMiss)));

    client.set(&Item::new("exp", "v").with_expiration(1)).expect("set");
    std::thread::sleep(Duration::from_millis(2100));
    assert!(matches!(client.get("exp"), Err(McError::CacheMiss)));
}
