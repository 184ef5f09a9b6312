//! End-to-end swarm behavior over loopback.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use hivemap::rpc::State;
use hivemap::{Dht, DhtBuilder, Value};

fn node() -> DhtBuilder {
    let _ = tracing_subscriber::fmt().try_init();
    Dht::builder().interface(Ipv4Addr::LOCALHOST)
}

#[test]
fn isolated_node_cannot_set() {
    let dht = node().build().unwrap();

    assert!(
        !dht.set("k", "v").unwrap(),
        "set must fail without known neighbors"
    );
    assert_eq!(dht.get("k").unwrap(), None);
}

#[test]
fn two_node_set_and_get() {
    let a = node().build().unwrap();
    let b = node().build().unwrap();

    let joined = b.bootstrap(&[a.info().unwrap().local_addr()]).unwrap();
    assert!(joined >= 1, "bootstrap should discover the seed");

    assert!(b.set("foo", "bar").unwrap());
    assert_eq!(a.get("foo").unwrap(), Some(Value::from("bar")));
    assert_eq!(b.get("foo").unwrap(), Some(Value::from("bar")));
}

#[test]
fn values_round_trip_all_types() {
    let a = node().build().unwrap();
    let b = node().build().unwrap();
    b.bootstrap(&[a.info().unwrap().local_addr()]).unwrap();

    assert!(b.set("int", 42i64).unwrap());
    assert!(b.set("float", 2.5f64).unwrap());
    assert!(b.set("flag", true).unwrap());

    assert_eq!(a.get("int").unwrap(), Some(Value::Integer(42)));
    assert_eq!(a.get("float").unwrap(), Some(Value::Float(2.5)));
    assert_eq!(a.get("flag").unwrap(), Some(Value::Bool(true)));
}

#[test]
fn later_write_wins_across_the_swarm() {
    let a = node().build().unwrap();
    let b = node().build().unwrap();
    b.bootstrap(&[a.info().unwrap().local_addr()]).unwrap();

    assert!(b.set("color", "red").unwrap());
    assert!(b.set("color", "blue").unwrap());

    assert_eq!(a.get("color").unwrap(), Some(Value::from("blue")));
}

#[test]
fn small_swarm_converges() {
    let seed = node().build().unwrap();
    let seed_addr = seed.info().unwrap().local_addr();

    let peers: Vec<Dht> = (0..4)
        .map(|_| {
            let peer = node().build().unwrap();
            peer.bootstrap(&[seed_addr]).unwrap();
            peer
        })
        .collect();

    assert!(peers[3].set("shared", "state").unwrap());

    assert_eq!(peers[0].get("shared").unwrap(), Some(Value::from("state")));
    assert_eq!(seed.get("shared").unwrap(), Some(Value::from("state")));
}

#[test]
fn dead_bootstrap_peer_times_out() {
    let dht = node()
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let nowhere = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
    let joined = dht.bootstrap(&[nowhere]).unwrap();

    assert_eq!(joined, 0);
    assert_eq!(
        dht.info().unwrap().table_size(),
        0,
        "a dead peer must not linger in the routing table"
    );
}

#[test]
fn state_survives_a_restart() {
    let seed = node().build().unwrap();
    let dht = node().build().unwrap();
    dht.bootstrap(&[seed.info().unwrap().local_addr()]).unwrap();

    let dir = std::env::temp_dir().join(format!("hivemap-swarm-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("node.state");

    dht.save_state(&path).unwrap();

    let state = State::read(&path).unwrap();
    assert_eq!(state.ksize, 3);
    assert_eq!(state.alpha, 2);
    assert!(state
        .bootstrap_addresses()
        .contains(&seed.info().unwrap().local_addr()));

    let restored = Dht::load_state(&path, 0, Ipv4Addr::LOCALHOST).unwrap();
    let info = restored.info().unwrap();
    assert_eq!(info.id(), dht.info().unwrap().id());
    assert_eq!(
        *info.local_addr().ip(),
        Ipv4Addr::LOCALHOST,
        "a restored node must bind to the requested interface"
    );

    std::fs::remove_file(&path).unwrap();
}
