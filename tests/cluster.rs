//! End-to-end tests over a real TCP socket against a file-backed volume.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use blockhouse::format::{
    mkfs, MkfsParams, NetLock, VolumeOptions, GREETING_FLAG_QUORUM, LOCK_MODE_WRITE,
    SERVER_DATA_FILL_TARGET, SERVER_META_FILL_TARGET, VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT,
};
use blockhouse::net::Client;
use blockhouse::server::{Server, ServerConfig};
use blockhouse::Error;

struct Cluster {
    server: Option<Server>,
    _dir: tempfile::TempDir,
    path: PathBuf,
    fsid: u64,
    term: u64,
}

impl Cluster {
    fn new() -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol");
        let sup = mkfs(&path, MkfsParams { meta_blocks: 8192, data_blocks: 16384 }).unwrap();
        let mut cluster =
            Cluster { server: None, _dir: dir, path, fsid: sup.hdr.fsid, term: 0 };
        cluster.start();
        cluster
    }

    fn start(&mut self) {
        self.term += 1;
        let mut cfg = ServerConfig::new(&self.path, "127.0.0.1:0".parse().unwrap());
        cfg.term = self.term;
        cfg.recovery_timeout = Duration::from_millis(500);
        cfg.reclaim_interval = Duration::from_millis(50);
        self.server = Some(Server::start(cfg).unwrap());
    }

    fn addr(&self) -> SocketAddr {
        self.server.as_ref().unwrap().local_addr()
    }

    fn stop(&mut self) {
        self.server.take().unwrap().stop().unwrap();
    }
}

#[test]
fn inode_allocation_is_monotonic_across_restart() {
    let mut cluster = Cluster::new();
    let mut client = Client::connect_new(cluster.addr(), cluster.fsid).unwrap();

    let (ino1, nr1) = client.alloc_inodes(100).unwrap();
    assert_eq!(nr1, 100);
    let (ino2, nr2) = client.alloc_inodes(10).unwrap();
    assert!(ino2 >= ino1 + 100);
    assert_eq!(nr2, 10);

    let rid = client.rid();
    let term = client.greeting.server_term;
    drop(client);

    cluster.stop();
    cluster.start();

    // the same mount reconnects to the new server instance
    let mut client =
        Client::connect(cluster.addr(), cluster.fsid, rid, term, GREETING_FLAG_QUORUM).unwrap();
    let (ino3, _) = client.alloc_inodes(1).unwrap();
    assert!(ino3 >= ino2 + 10);

    client.farewell().unwrap();
    cluster.stop();
}

#[test]
fn greeting_rejects_wrong_identity() {
    let mut cluster = Cluster::new();
    match Client::connect_new(cluster.addr(), cluster.fsid ^ 1) {
        Err(Error::Invalid) => {}
        other => panic!("expected invalid greeting, got {:?}", other.map(|_| ())),
    }
    cluster.stop();
}

#[test]
fn log_trees_issue_and_commit() {
    let mut cluster = Cluster::new();
    let mut client = Client::connect_new(cluster.addr(), cluster.fsid).unwrap();

    let lt = client.get_log_trees().unwrap();
    assert_eq!(lt.rid, client.rid());
    assert_eq!(lt.nr, 1);
    assert_eq!(lt.meta_avail.total_nr, SERVER_META_FILL_TARGET);
    assert_eq!(lt.data_avail.total_len, SERVER_DATA_FILL_TARGET);

    let roots_before = client.get_roots().unwrap();
    client.commit_log_trees(&lt).unwrap();
    let roots_after = client.get_roots().unwrap();
    assert_ne!(roots_before, roots_after);

    // a refresh finds the same record and keeps the pools full
    let lt2 = client.get_log_trees().unwrap();
    assert_eq!(lt2.nr, 1);
    assert_eq!(lt2.meta_avail.total_nr, SERVER_META_FILL_TARGET);

    client.farewell().unwrap();
    cluster.stop();
}

#[test]
fn seq_advance_over_the_wire() {
    let mut cluster = Cluster::new();
    // non-quorum mounts, so their farewells are answered without any
    // majority bookkeeping at the end
    let mut a = Client::connect(cluster.addr(), cluster.fsid, 0xa1, 0, 0).unwrap();
    let mut b = Client::connect(cluster.addr(), cluster.fsid, 0xb2, 0, 0).unwrap();

    let sa = a.advance_seq().unwrap();
    let sb = b.advance_seq().unwrap();
    assert!(sb > sa);
    assert_eq!(a.get_last_seq().unwrap(), sa - 1);

    let sa2 = a.advance_seq().unwrap();
    assert!(sa2 > sb);
    assert_eq!(a.get_last_seq().unwrap(), sb - 1);

    a.farewell().unwrap();
    b.farewell().unwrap();
    cluster.stop();
}

#[test]
fn volume_options_validated_and_persistent() {
    let mut cluster = Cluster::new();
    let mut client = Client::connect_new(cluster.addr(), cluster.fsid).unwrap();

    let mut bad = VolumeOptions::default();
    bad.set_bits = VOLOPT_DATA_ALLOC_ZONE_BLOCKS_BIT;
    bad.data_alloc_zone_blocks = SERVER_DATA_FILL_TARGET - 1;
    assert!(matches!(client.set_volopt(&bad), Err(Error::Invalid)));

    let mut good = bad;
    good.data_alloc_zone_blocks = SERVER_DATA_FILL_TARGET;
    client.set_volopt(&good).unwrap();
    assert_eq!(
        client.get_volopt().unwrap().zone_blocks(),
        Some(SERVER_DATA_FILL_TARGET)
    );

    let rid = client.rid();
    let term = client.greeting.server_term;
    drop(client);
    cluster.stop();
    cluster.start();

    let mut client =
        Client::connect(cluster.addr(), cluster.fsid, rid, term, GREETING_FLAG_QUORUM).unwrap();
    assert_eq!(
        client.get_volopt().unwrap().zone_blocks(),
        Some(SERVER_DATA_FILL_TARGET)
    );

    client.clear_volopt(&good).unwrap();
    assert_eq!(client.get_volopt().unwrap().zone_blocks(), None);

    client.farewell().unwrap();
    cluster.stop();
}

#[test]
fn farewell_repeats_after_reconnect() {
    let mut cluster = Cluster::new();
    let mut client = Client::connect_new(cluster.addr(), cluster.fsid).unwrap();
    let rid = client.rid();
    let term = client.greeting.server_term;

    client.farewell().unwrap();
    drop(client);

    // the response could have been lost; the retransmitted farewell from a
    // reconnect succeeds immediately because the mounted record is gone
    let mut again =
        Client::connect(cluster.addr(), cluster.fsid, rid, term, GREETING_FLAG_QUORUM).unwrap();
    again.farewell().unwrap();

    cluster.stop();
}

#[test]
fn collaborator_commands_respond() {
    let mut cluster = Cluster::new();
    let mut client = Client::connect_new(cluster.addr(), cluster.fsid).unwrap();

    let nl = NetLock {
        key: blockhouse::format::Key::new(1, 10, 0),
        old_mode: 0,
        new_mode: LOCK_MODE_WRITE,
        _pad: [0; 6],
    };
    let granted = client.lock(&nl).unwrap();
    assert_eq!(granted.new_mode, LOCK_MODE_WRITE);

    let map = client.open_ino_map(3).unwrap();
    assert_eq!(map.group_nr, 3);
    assert!(map.bits.iter().all(|&w| w == 0));

    // nothing has been rotated yet, so there is no compaction work
    assert!(matches!(client.srch_get_compact(), Err(Error::NotFound)));

    client.farewell().unwrap();
    cluster.stop();
}
