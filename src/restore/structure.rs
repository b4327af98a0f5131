// sitevault/src/restore/structure.rs
use std::fs;
use std::path::Path;

use crate::backup::documents::{CONFIG_OVERRIDE_FILE, METADATA_FILE, SEQUENCES_FILE, STRUCTURE_FILE};
use crate::checks::{restore_checks, run_checks, CheckContext, CheckReport};
use crate::errors::{Result, VaultError};
use crate::operation::{Metadata, OperationLog};
use crate::remote::{Phase, RemoteBackupDescriptor, RemoteStatus};
use crate::schema::{ConfigOverride, DbStructure, SequenceMap};
use crate::site::Site;
use crate::utils::archive::unpack_archive;
use crate::utils::display_size;

/// Everything read from a backup's structure archive.
#[derive(Debug, Clone)]
pub struct BackupStructure {
    pub descriptor: RemoteBackupDescriptor,
    pub structure: DbStructure,
    pub sequences: SequenceMap,
    pub overrides: Vec<ConfigOverride>,
    pub origin: Metadata,
}

/// Remote descriptor of a backup that may be restored.
pub async fn fetch_descriptor(site: &Site, backupkey: &str) -> Result<RemoteBackupDescriptor> {
    let descriptor = site.remote()?.get_descriptor(backupkey).await?;
    if descriptor.status != RemoteStatus::Finished {
        return Err(VaultError::PolicyViolation(format!(
            "Backup {} is {}, only finished backups can be restored",
            backupkey, descriptor.status
        )));
    }
    Ok(descriptor)
}

fn read_optional<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Downloads and parses the structure archive into `work/dbstructure`.
pub async fn fetch_structure(
    site: &Site,
    backupkey: &str,
    work: &Path,
    log: &OperationLog,
) -> Result<BackupStructure> {
    let descriptor = fetch_descriptor(site, backupkey).await?;
    let archive = work.join(Phase::DbStructure.file_name());
    let size = site.remote()?.download(backupkey, Phase::DbStructure, &archive).await?;
    log.info(format!("Downloaded {} ({})", Phase::DbStructure, display_size(size))).await;

    let dir = work.join("dbstructure");
    unpack_archive(&archive, &dir).await?;
    fs::remove_file(&archive)?;

    let structure_path = dir.join(STRUCTURE_FILE);
    if !structure_path.is_file() {
        return Err(VaultError::Integrity(format!(
            "Backup {} has no {}",
            backupkey, STRUCTURE_FILE
        )));
    }
    Ok(BackupStructure {
        descriptor,
        structure: DbStructure::load_from_backup(&structure_path)?,
        sequences: read_optional(&dir.join(SEQUENCES_FILE))?,
        overrides: read_optional(&dir.join(CONFIG_OVERRIDE_FILE))?,
        origin: read_optional(&dir.join(METADATA_FILE))?,
    })
}

/// Runs the restore checks against this site. Nothing is modified.
pub async fn precheck(site: &Site, backup: &BackupStructure, log: &OperationLog) -> Result<CheckReport> {
    let actual = DbStructure::load_actual(site.db.as_ref()).await?;
    let ctx = CheckContext {
        settings: &site.settings,
        descriptor: &backup.descriptor,
        origin: &backup.origin,
        structure: &backup.structure,
        actual: &actual,
        host: site.host.as_ref(),
    };
    Ok(run_checks(&restore_checks(), &ctx, log).await)
}
