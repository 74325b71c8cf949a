//! Shared fleet fixture: engines wired over the in-process hub with a
//! manual wall clock and shortened timer periods.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatemesh::config::Config;
use gatemesh::core::{PassEntry, PassSnapshot, PassType};
use gatemesh::engine::Engine;
use gatemesh::testkit::{ManualClock, MemoryHub, SeqIds};

/// 2024-11-14 12:00:00 UTC.
pub const T0: u64 = 1_731_585_600_000;

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}

pub fn write_passes(dir: &Path, codes: &[(&str, PassType)]) -> PathBuf {
    let passes = codes
        .iter()
        .map(|(code, pass_type)| {
            (
                code.to_string(),
                PassEntry {
                    pass_type: *pass_type,
                    days: None,
                    count: None,
                },
            )
        })
        .collect();
    let snapshot = PassSnapshot { passes };
    let path = dir.join("passes.json");
    std::fs::write(&path, snapshot.to_json().unwrap()).unwrap();
    path
}

pub fn node_config(root: &Path, name: &str, passes: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = Some(root.join(name));
    config.passes_path = Some(passes.to_path_buf());
    config.timers.heartbeat_ms = 100;
    config.timers.retry_ack_ms = 50;
    config.timers.state_hash_ms = 150;
    config.timers.full_sync_ms = 200;
    config.timers.retry_queue_ms = 100;
    config
}

pub fn start_node(
    hub: &MemoryHub,
    clock: &ManualClock,
    config: &Config,
    addr: IpAddr,
    id_base: u64,
) -> Engine {
    Engine::init_with(
        config,
        Box::new(hub.join(addr)),
        Arc::new(clock.clone()),
        Arc::new(SeqIds::with_base(id_base)),
    )
    .expect("engine init")
}

/// Poll `probe` until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
