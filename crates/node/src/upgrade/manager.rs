//! The upgrade manager proper.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use eks_chain::types::EpochTime;

use super::migrations::{MigrationContext, MigrationRegistry};
use super::{Descriptor, Error, PendingUpgrade, UpgradeStage, INVALID_UPGRADE_HEIGHT};

const PENDING_FILE: &str = "pending-upgrades.cbor";

/// File-backed store for the pending upgrade list. The whole list is
/// CBOR-encoded under a single key and replaced atomically on every
/// mutation (write to a temporary file, then rename).
struct Store {
    path: PathBuf,
}

impl Store {
    fn open(data_dir: &Path) -> Store {
        Store {
            path: data_dir.join(PENDING_FILE),
        }
    }

    fn load(&self) -> Result<Option<Vec<PendingUpgrade>>, Error> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Persistence(err.to_string())),
        };
        let pending =
            serde_cbor::from_slice(&raw).map_err(|err| Error::Persistence(err.to_string()))?;
        Ok(Some(pending))
    }

    fn save(&self, pending: &[PendingUpgrade]) -> Result<(), Error> {
        if pending.is_empty() {
            return self.delete();
        }
        let encoded =
            serde_cbor::to_vec(&pending).map_err(|err| Error::Persistence(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(|err| Error::Persistence(err.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|err| Error::Persistence(err.to_string()))
    }

    fn delete(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Persistence(err.to_string())),
        }
    }
}

struct Inner {
    pending: Vec<PendingUpgrade>,
    /// Latched once a stop has been requested, so re-entry before the node
    /// actually stopped cannot proceed with the upgrade.
    should_stop: bool,
}

/// The per-node upgrade manager.
///
/// `submit_descriptor` may be called from the external API concurrently
/// with `consensus_upgrade` from the consensus thread, hence the mutex
/// around the pending list.
pub struct Manager {
    inner: Mutex<Inner>,
    store: Store,
    registry: MigrationRegistry,
    running_version: String,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    /// Opens the manager over the node's data directory. With
    /// `check_status` set, every previously persisted non-completed upgrade
    /// is validated: its handler must exist, and if its epoch has already
    /// been reached the running binary must be the upgrade target.
    pub fn new(
        data_dir: &Path,
        running_version: impl Into<String>,
        registry: MigrationRegistry,
        check_status: bool,
    ) -> Result<Manager, Error> {
        let manager = Manager {
            inner: Mutex::new(Inner {
                pending: Vec::new(),
                should_stop: false,
            }),
            store: Store::open(data_dir),
            registry,
            running_version: running_version.into(),
        };
        if check_status {
            manager.check_status()?;
        } else if let Some(pending) = manager.store.load()? {
            manager.inner.lock().pending = pending;
        }
        Ok(manager)
    }

    fn check_status(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        match self.store.load()? {
            None => {
                debug!("no pending descriptors, continuing startup");
                return Ok(());
            }
            Some(pending) => inner.pending = pending,
        }

        for pu in &inner.pending {
            if pu.is_completed() {
                continue;
            }
            if pu.upgrade_height == INVALID_UPGRADE_HEIGHT {
                continue;
            }

            // The upgrade should proceed right now; this must be the right
            // binary and the handler must exist.
            pu.descriptor.ensure_compatible(&self.running_version)?;
            self.registry.get(&pu.descriptor.handler)?;
        }

        self.flush_locked(&mut inner)?;
        info!(pending = inner.pending.len(), "loaded pending upgrade metadata");
        Ok(())
    }

    /// Drops completed upgrades and persists the remainder.
    fn flush_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        inner.pending.retain(|pu| {
            if pu.is_completed() {
                info!(handler = %pu.descriptor.handler, "upgrade completed, removing state");
                false
            } else {
                true
            }
        });
        self.store.save(&inner.pending)
    }

    /// Schedules a new upgrade. Equal descriptors are rejected, so
    /// submission is idempotent up to the error.
    pub fn submit_descriptor(&self, descriptor: Descriptor) -> Result<(), Error> {
        descriptor.validate_basic()?;

        let mut inner = self.inner.lock();
        if inner.pending.iter().any(|pu| pu.descriptor == descriptor) {
            return Err(Error::AlreadyPending);
        }

        info!(
            handler = %descriptor.handler,
            epoch = descriptor.epoch,
            "received upgrade descriptor"
        );
        inner.pending.push(PendingUpgrade::new(descriptor));
        self.flush_locked(&mut inner)
    }

    /// Snapshot of the pending upgrade list.
    pub fn pending_upgrades(&self) -> Vec<PendingUpgrade> {
        self.inner.lock().pending.clone()
    }

    /// Whether a non-completed upgrade is stamped for the given height.
    pub fn has_pending_upgrade_at(&self, height: u64) -> Result<bool, Error> {
        if height == INVALID_UPGRADE_HEIGHT {
            return Err(Error::BadDescriptor);
        }
        Ok(self
            .inner
            .lock()
            .pending
            .iter()
            .any(|pu| !pu.is_completed() && pu.upgrade_height == height))
    }

    pub fn get_upgrade(&self, descriptor: &Descriptor) -> Result<PendingUpgrade, Error> {
        self.inner
            .lock()
            .pending
            .iter()
            .find(|pu| pu.descriptor == *descriptor)
            .cloned()
            .ok_or(Error::UpgradeNotFound)
    }

    /// Cancels a submitted upgrade. Only possible while no height has been
    /// stamped and no stage has run.
    pub fn cancel_upgrade(&self, descriptor: &Descriptor) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            // Nothing pending; make sure nothing stale is saved either.
            return self.flush_locked(&mut inner);
        }

        for pu in &inner.pending {
            if pu.descriptor == *descriptor
                && (pu.upgrade_height != INVALID_UPGRADE_HEIGHT || pu.has_any_stages())
            {
                return Err(Error::UpgradeInProgress);
            }
        }

        let before = inner.pending.clone();
        inner.pending.retain(|pu| pu.descriptor != *descriptor);
        if let Err(err) = self.flush_locked(&mut inner) {
            inner.pending = before;
            return Err(err);
        }
        Ok(())
    }

    /// Runs the startup stage of every stamped upgrade. Safe to call again
    /// after a restart: already recorded stages are skipped.
    pub fn startup_upgrade(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        for i in 0..inner.pending.len() {
            let pu = &inner.pending[i];
            if pu.upgrade_height == INVALID_UPGRADE_HEIGHT {
                continue;
            }
            if pu.has_stage(UpgradeStage::Startup) {
                warn!(handler = %pu.descriptor.handler, "startup upgrade already performed, skipping");
                continue;
            }

            warn!(handler = %pu.descriptor.handler, "performing startup upgrade");
            let handler = self.registry.get(&pu.descriptor.handler)?;
            handler.startup_upgrade()?;
            inner.pending[i].push_stage(UpgradeStage::Startup);
        }
        self.flush_locked(&mut inner)
    }

    /// Advances pending upgrades from the consensus side. Called at every
    /// block with the current epoch and height; `ctx` carries the state
    /// handle for the consensus-stage migration and may only be absent for
    /// informational probes.
    pub fn consensus_upgrade(
        &self,
        mut ctx: Option<&mut MigrationContext<'_>>,
        current_epoch: EpochTime,
        current_height: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        // A stop was already requested; never proceed with the upgrade in
        // this process.
        if inner.should_stop {
            return Err(Error::StopForUpgrade);
        }

        for i in 0..inner.pending.len() {
            let pu = &inner.pending[i];

            if pu.upgrade_height == INVALID_UPGRADE_HEIGHT {
                // Below the upgrade epoch this binary runs normally; startup
                // made sure it is an appropriate one.
                if current_epoch < pu.descriptor.epoch {
                    continue;
                }

                inner.pending[i].upgrade_height = current_height;
                self.flush_locked(&mut inner)?;

                // An in-place upgrade is possible when the binary is already
                // the target and the handler needs no startup stage.
                let pu = &inner.pending[i];
                let must_stop = pu.descriptor.ensure_compatible(&self.running_version).is_err()
                    || match self.registry.get(&pu.descriptor.handler) {
                        Ok(handler) => handler.has_startup_upgrade(),
                        Err(_) => true,
                    };
                if must_stop {
                    inner.should_stop = true;
                    return Err(Error::StopForUpgrade);
                }

                info!("skipping node restart as no startup upgrade stage needed");
                inner.pending[i].push_stage(UpgradeStage::Startup);
            }

            let pu = &inner.pending[i];
            if pu.upgrade_height < current_height {
                // Already past the upgrade height: everything must have
                // completed.
                inner.pending[i].push_stage(UpgradeStage::Consensus);
                continue;
            }
            if pu.upgrade_height > current_height {
                return Err(Error::Persistence(
                    "upgrade height is in the future but the upgrade epoch was seen".into(),
                ));
            }

            if !pu.has_stage(UpgradeStage::Consensus) {
                if let Some(ctx) = ctx.as_deref_mut() {
                    warn!(handler = %pu.descriptor.handler, "performing consensus upgrade");
                    let handler = self.registry.get(&pu.descriptor.handler)?;
                    handler.consensus_upgrade(ctx)?;
                    inner.pending[i].push_stage(UpgradeStage::Consensus);
                }
            }
        }

        self.flush_locked(&mut inner)
    }

    /// Flushes state on shutdown.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Err(err) = self.flush_locked(&mut inner) {
            warn!(%err, "failed to flush pending upgrades on close");
        }
    }
}
