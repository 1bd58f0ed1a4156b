//! Shared test harness: a registry over a temporary data directory with
//! in-memory drivers bound to a few foreign servers.

use fedtx_common::{BackendId, DatabaseId, ServerId, TwophaseCommitLevel, UserId, UserMappingId,
    XactConfig};
use fedtx_driver::{DriverRegistry, MemoryDriver, MemoryDriverState, ParticipantKey};
use fedtx_wal::Wal;
use fedtx_xact::XactRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const DB: DatabaseId = DatabaseId(1);
pub const BACKEND: BackendId = BackendId(1);

pub struct Harness {
    _dir: TempDir,
    pub data_dir: PathBuf,
    pub registry: Arc<XactRegistry>,
    pub driver_states: HashMap<u32, Arc<Mutex<MemoryDriverState>>>,
}

pub fn key(server: u32) -> ParticipantKey {
    ParticipantKey {
        server: ServerId(server),
        user: UserId(10),
        umid: UserMappingId(100 + server),
    }
}

fn bind_drivers(servers: &[(u32, bool)]) -> (Arc<DriverRegistry>, HashMap<u32, Arc<Mutex<MemoryDriverState>>>) {
    let drivers = Arc::new(DriverRegistry::new());
    let mut states = HashMap::new();
    for &(server, two_phase) in servers {
        let driver = if two_phase {
            MemoryDriver::new()
        } else {
            MemoryDriver::one_phase_only()
        };
        states.insert(server, driver.state());
        let name = format!("memory-{server}");
        drivers.register(name.as_str(), Arc::new(driver));
        drivers.bind_server(ServerId(server), name.as_str()).unwrap();
    }
    (drivers, states)
}

pub fn setup(capacity: usize, level: TwophaseCommitLevel, servers: &[(u32, bool)]) -> Harness {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_path_buf();
    let wal = Arc::new(Wal::open(data_dir.join("wal")).unwrap());
    let (drivers, driver_states) = bind_drivers(servers);
    let registry = Arc::new(
        XactRegistry::new(
            XactConfig {
                max_prepared_foreign_xacts: capacity,
                foreign_twophase_commit: level,
            },
            wal,
            drivers,
            &data_dir,
        )
        .unwrap(),
    );
    Harness {
        _dir: dir,
        data_dir,
        registry,
        driver_states,
    }
}

impl Harness {
    /// Simulate a restart: a fresh registry over the same data directory,
    /// with fresh drivers (the in-memory participants forget their
    /// prepared transactions, as a crashed connection would not).
    pub fn reopen(&mut self, capacity: usize, level: TwophaseCommitLevel, servers: &[(u32, bool)]) {
        let wal = Arc::new(Wal::open(self.data_dir.join("wal")).unwrap());
        let (drivers, driver_states) = bind_drivers(servers);
        self.driver_states = driver_states;
        self.registry = Arc::new(
            XactRegistry::new(
                XactConfig {
                    max_prepared_foreign_xacts: capacity,
                    foreign_twophase_commit: level,
                },
                wal,
                drivers,
                &self.data_dir,
            )
            .unwrap(),
        );
    }
}
