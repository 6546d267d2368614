//! Upgrade manager lifecycle tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eks_chain::mkvs::MemoryTree;
use tempfile::TempDir;

use super::migrations::{EmptyMigration, Migration, MigrationContext, MigrationRegistry};
use super::{Descriptor, Error, Manager, UpgradeStage, INVALID_UPGRADE_HEIGHT, LATEST_DESCRIPTOR_VERSION};

/// Counts stage invocations so tests can assert idempotence.
struct CountingMigration {
    with_startup: bool,
    startup_runs: AtomicUsize,
    consensus_runs: AtomicUsize,
}

impl CountingMigration {
    fn new(with_startup: bool) -> Arc<Self> {
        Arc::new(CountingMigration {
            with_startup,
            startup_runs: AtomicUsize::new(0),
            consensus_runs: AtomicUsize::new(0),
        })
    }
}

impl Migration for CountingMigration {
    fn has_startup_upgrade(&self) -> bool {
        self.with_startup
    }

    fn startup_upgrade(&self) -> Result<(), Error> {
        self.startup_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn consensus_upgrade(&self, _ctx: &mut MigrationContext<'_>) -> Result<(), Error> {
        self.consensus_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn descriptor(handler: &str, epoch: u64) -> Descriptor {
    Descriptor {
        version: LATEST_DESCRIPTOR_VERSION,
        handler: handler.into(),
        target: "23.0".into(),
        epoch,
    }
}

fn manager_with(
    dir: &Path,
    version: &str,
    handler: &str,
    migration: Arc<dyn Migration>,
) -> Manager {
    let mut registry = MigrationRegistry::new();
    registry.register(handler, migration);
    Manager::new(dir, version, registry, true).unwrap()
}

#[test]
fn submit_is_idempotent_up_to_already_pending() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(dir.path(), "23.0", "h", Arc::new(EmptyMigration));

    manager.submit_descriptor(descriptor("h", 5)).unwrap();
    assert!(matches!(
        manager.submit_descriptor(descriptor("h", 5)),
        Err(Error::AlreadyPending)
    ));
    assert_eq!(manager.pending_upgrades().len(), 1);
}

#[test]
fn malformed_descriptors_are_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(dir.path(), "23.0", "h", Arc::new(EmptyMigration));

    let mut bad = descriptor("", 5);
    assert!(matches!(
        manager.submit_descriptor(bad.clone()),
        Err(Error::BadDescriptor)
    ));
    bad = descriptor("h", 5);
    bad.version = 99;
    assert!(matches!(
        manager.submit_descriptor(bad),
        Err(Error::BadDescriptor)
    ));
}

#[test]
fn in_place_upgrade_path_completes_without_stop() {
    // The binary already matches the target and the handler has no startup
    // stage, so the upgrade runs in place: startup stage recorded, the
    // consensus migration executed, and the pending list cleared.
    let dir = TempDir::new().unwrap();
    let migration = CountingMigration::new(false);
    let manager = manager_with(dir.path(), "23.0", "h", migration.clone());

    manager.submit_descriptor(descriptor("h", 5)).unwrap();

    // Below the upgrade epoch nothing happens.
    let mut tree = MemoryTree::new();
    let mut ctx = MigrationContext { tree: &mut tree };
    manager.consensus_upgrade(Some(&mut ctx), 4, 40).unwrap();
    let pending = manager.pending_upgrades();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].upgrade_height, INVALID_UPGRADE_HEIGHT);
    assert!(!pending[0].has_any_stages());

    // At the upgrade epoch everything completes in one call.
    manager.consensus_upgrade(Some(&mut ctx), 5, 50).unwrap();
    assert!(manager.pending_upgrades().is_empty());
    assert_eq!(migration.startup_runs.load(Ordering::SeqCst), 0);
    assert_eq!(migration.consensus_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn startup_stage_forces_stop_and_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let migration = CountingMigration::new(true);
    let manager = manager_with(dir.path(), "23.0", "h", migration.clone());

    manager.submit_descriptor(descriptor("h", 5)).unwrap();

    let mut tree = MemoryTree::new();
    let mut ctx = MigrationContext { tree: &mut tree };
    assert!(matches!(
        manager.consensus_upgrade(Some(&mut ctx), 5, 50),
        Err(Error::StopForUpgrade)
    ));
    // Re-entry before the node stopped must keep refusing.
    assert!(matches!(
        manager.consensus_upgrade(Some(&mut ctx), 5, 50),
        Err(Error::StopForUpgrade)
    ));

    // "Restart": a fresh manager over the same data directory.
    let migration2 = CountingMigration::new(true);
    let manager = manager_with(dir.path(), "23.0", "h", migration2.clone());
    let pending = manager.pending_upgrades();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].upgrade_height, 50);

    manager.startup_upgrade().unwrap();
    assert_eq!(migration2.startup_runs.load(Ordering::SeqCst), 1);
    assert!(manager.pending_upgrades()[0].has_stage(UpgradeStage::Startup));

    // Re-running the startup stage is a no-op.
    manager.startup_upgrade().unwrap();
    assert_eq!(migration2.startup_runs.load(Ordering::SeqCst), 1);

    // The consensus stage runs at the stamped height and clears the list.
    manager.consensus_upgrade(Some(&mut ctx), 5, 50).unwrap();
    assert_eq!(migration2.consensus_runs.load(Ordering::SeqCst), 1);
    assert!(manager.pending_upgrades().is_empty());
}

#[test]
fn incompatible_binary_requests_stop() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(dir.path(), "22.0", "h", Arc::new(EmptyMigration));

    manager.submit_descriptor(descriptor("h", 5)).unwrap();
    let mut tree = MemoryTree::new();
    let mut ctx = MigrationContext { tree: &mut tree };
    assert!(matches!(
        manager.consensus_upgrade(Some(&mut ctx), 5, 50),
        Err(Error::StopForUpgrade)
    ));
}

#[test]
fn cancel_only_before_any_progress() {
    let dir = TempDir::new().unwrap();
    // A handler with a startup stage keeps the upgrade pending after the
    // stop request, so the stamped state is observable.
    let manager = manager_with(dir.path(), "23.0", "h", CountingMigration::new(true));

    let d = descriptor("h", 5);
    manager.submit_descriptor(d.clone()).unwrap();
    manager.cancel_upgrade(&d).unwrap();
    assert!(manager.pending_upgrades().is_empty());

    // Cancelling an unknown descriptor is a no-op.
    manager.cancel_upgrade(&d).unwrap();

    // Once the height is stamped, cancellation is refused.
    manager.submit_descriptor(d.clone()).unwrap();
    let mut tree = MemoryTree::new();
    let mut ctx = MigrationContext { tree: &mut tree };
    assert!(matches!(
        manager.consensus_upgrade(Some(&mut ctx), 5, 50),
        Err(Error::StopForUpgrade)
    ));

    let pu = manager.get_upgrade(&d).unwrap();
    assert_ne!(pu.upgrade_height, INVALID_UPGRADE_HEIGHT);
    assert!(matches!(
        manager.cancel_upgrade(&d),
        Err(Error::UpgradeInProgress)
    ));
}

#[test]
fn pending_list_persists_across_restarts() {
    let dir = TempDir::new().unwrap();
    {
        let manager = manager_with(dir.path(), "23.0", "h", Arc::new(EmptyMigration));
        manager.submit_descriptor(descriptor("h", 9)).unwrap();
        manager.close();
    }
    {
        let manager = manager_with(dir.path(), "23.0", "h", Arc::new(EmptyMigration));
        let pending = manager.pending_upgrades();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].descriptor.epoch, 9);
    }
}

#[test]
fn check_status_rejects_missing_handler_for_stamped_upgrade() {
    let dir = TempDir::new().unwrap();
    {
        let migration = CountingMigration::new(true);
        let manager = manager_with(dir.path(), "23.0", "h", migration);
        manager.submit_descriptor(descriptor("h", 5)).unwrap();
        let mut tree = MemoryTree::new();
        let mut ctx = MigrationContext { tree: &mut tree };
        let _ = manager.consensus_upgrade(Some(&mut ctx), 5, 50);
    }
    // Restart with a registry that no longer knows the handler.
    let err = Manager::new(dir.path(), "23.0", MigrationRegistry::new(), true).unwrap_err();
    assert!(matches!(err, Error::HandlerMissing(_)));
}

#[test]
fn has_pending_upgrade_at_matches_stamped_height() {
    let dir = TempDir::new().unwrap();
    let migration = CountingMigration::new(true);
    let manager = manager_with(dir.path(), "23.0", "h", migration);

    manager.submit_descriptor(descriptor("h", 5)).unwrap();
    assert!(!manager.has_pending_upgrade_at(50).unwrap());

    let mut tree = MemoryTree::new();
    let mut ctx = MigrationContext { tree: &mut tree };
    let _ = manager.consensus_upgrade(Some(&mut ctx), 5, 50);

    assert!(manager.has_pending_upgrade_at(50).unwrap());
    assert!(!manager.has_pending_upgrade_at(51).unwrap());
    assert!(manager.has_pending_upgrade_at(INVALID_UPGRADE_HEIGHT).is_err());
}
