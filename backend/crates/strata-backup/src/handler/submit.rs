use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_commons::{JobId, JobType, TableRef, TargetKey};

use super::restore_filter::filter_snapshot;
use super::BackupHandler;
use crate::context::{DatabaseInfo, DatabaseReadGuard};
use crate::error::{BackupError, Result};
use crate::jobs::{now_millis, BackupJob, Job, JobCommon, JobStateMachine, RestoreJob};
use crate::journal::JournalEntry;
use crate::meta::{BackupMeta, MV_BACKUP_INACTIVE_REASON};
use crate::request::{BackupRequest, BackupType, RestoreRequest};

impl BackupHandler {
    /// Validate and admit a backup job.
    ///
    /// Validation, repository listing and the meta snapshot happen before the
    /// sequencing lock is taken; only the slot check and admission run under
    /// it.
    pub fn submit_backup(&self, request: BackupRequest) -> Result<JobId> {
        if request.backup_type == BackupType::Incremental {
            return Err(BackupError::validation(
                "Currently does not support incremental backup",
            ));
        }
        if request.label.trim().is_empty() {
            return Err(BackupError::validation("Backup label must not be empty"));
        }
        let timeout_ms = self.job_timeout(request.timeout_ms)?;

        let repo = self.ctx.repositories.resolve(&request.repo_name)?;
        if repo.is_read_only() {
            return Err(BackupError::conflict(format!(
                "Repository {} is read only",
                request.repo_name
            )));
        }

        let (target, db_name, table_refs, meta) = match &request.db_name {
            Some(db_name) => {
                let db = self.ctx.catalog.get_database(db_name).ok_or_else(|| {
                    BackupError::not_found(format!("Database {} does not exist", db_name))
                })?;
                if !request.catalogs.is_empty() {
                    return Err(BackupError::validation(
                        "Can not backup database objects and external catalogs together",
                    ));
                }
                let (refs, meta) = self.build_database_meta(&db, &request)?;
                (TargetKey::Database(db.id), db.name, refs, meta)
            }
            None => {
                if request.catalogs.is_empty() {
                    return Err(BackupError::validation(
                        "Nothing to backup: no database and no external catalog given",
                    ));
                }
                if !request.tables.is_empty() || !request.functions.is_empty() {
                    return Err(BackupError::validation(
                        "Tables and functions can only be backed up from a database",
                    ));
                }
                let meta = self.build_catalog_meta(&request)?;
                (TargetKey::ExternalCatalog, String::new(), Vec::new(), meta)
            }
        };

        let snapshots = repo.list_snapshots()?;
        if snapshots.iter().any(|label| label == &request.label) {
            return Err(BackupError::conflict(format!(
                "Snapshot with name '{}' already exist in repository",
                request.label
            )));
        }

        let _seq = self.lock_seq()?;
        self.check_slot(target)?;

        let job_id = self.ctx.ids.next_job_id();
        let common = JobCommon::new(
            job_id,
            request.label.clone(),
            target,
            db_name,
            repo.desc().id,
            JobType::Backup,
            now_millis(),
            timeout_ms,
        );
        let job = Job::Backup(BackupJob::new(common, table_refs, meta));
        self.admit(target, job)?;
        Ok(job_id)
    }

    /// Validate and admit a restore job. The target database is created when
    /// it does not exist yet.
    pub fn submit_restore(&self, request: RestoreRequest) -> Result<JobId> {
        if request.label.trim().is_empty() {
            return Err(BackupError::validation("Restore label must not be empty"));
        }
        if request.replication_num == Some(0) {
            return Err(BackupError::validation("Replication number must be positive"));
        }
        let timeout_ms = self.job_timeout(request.timeout_ms)?;
        let repo = self.ctx.repositories.resolve(&request.repo_name)?;

        let info = repo.get_snapshot_info(&request.label, request.backup_timestamp)?;
        match (&request.db_name, info.is_external_catalog_snapshot()) {
            (Some(_), true) => {
                return Err(BackupError::validation(format!(
                    "Snapshot {} holds external catalogs and cannot be restored into a database",
                    info.name
                )));
            }
            (None, false) => {
                return Err(BackupError::validation(format!(
                    "Snapshot {} holds database {}; a target database is required",
                    info.name, info.db_name
                )));
            }
            _ => {}
        }
        if let Some(origin) = &request.origin_db_name {
            if origin != &info.db_name {
                return Err(BackupError::validation(format!(
                    "Snapshot {} was taken from database {}, not {}",
                    info.name, info.db_name, origin
                )));
            }
        }

        let meta_version = request.meta_version.unwrap_or(info.meta_version);
        let meta = match repo.get_snapshot_meta(&info, meta_version) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!(
                    "Failed to download meta of snapshot {} ({}), restoring with empty scope: {}",
                    info.name,
                    info.backup_time,
                    e
                );
                None
            }
        };
        let (info, meta) = filter_snapshot(info, meta, &request)?;

        let _seq = self.lock_seq()?;
        let (target, db_name) = match &request.db_name {
            Some(name) => {
                let db = match self.ctx.catalog.get_database(name) {
                    Some(db) => db,
                    None => {
                        log::info!("Creating database {} for restore of {}", name, request.label);
                        self.ctx.catalog.create_database(name)?
                    }
                };
                (TargetKey::Database(db.id), db.name)
            }
            None => (TargetKey::ExternalCatalog, String::new()),
        };
        self.check_slot(target)?;

        let job_id = self.ctx.ids.next_job_id();
        let common = JobCommon::new(
            job_id,
            request.label.clone(),
            target,
            db_name,
            repo.desc().id,
            JobType::Restore,
            now_millis(),
            timeout_ms,
        );
        let job = Job::Restore(RestoreJob::new(
            common,
            info.backup_time,
            info,
            meta,
            request.allow_load,
            request.replication_num,
        ));
        self.admit(target, job)?;
        Ok(job_id)
    }

    fn job_timeout(&self, requested: Option<u64>) -> Result<u64> {
        match requested.unwrap_or(self.settings.default_job_timeout_ms) {
            0 => Err(BackupError::validation("Job timeout must be positive")),
            ms => Ok(ms),
        }
    }

    /// Fails if `target` already has a non-terminal job. Caller holds the
    /// sequencing lock.
    pub(super) fn check_slot(&self, target: TargetKey) -> Result<()> {
        if let Some(slot) = self.slot(&target) {
            if !slot.lock().is_done() {
                let scope = if target.is_external_catalog() {
                    "external catalog"
                } else {
                    "a database"
                };
                return Err(BackupError::conflict(format!(
                    "Can only run one backup or restore job of {} at same time",
                    scope
                )));
            }
        }
        Ok(())
    }

    /// Journal the new job, then make it visible.
    fn admit(&self, target: TargetKey, job: Job) -> Result<()> {
        self.append_entry(JournalEntry::UpsertJob(job.clone()))?;
        let common = job.common();
        common.log_info(&format!(
            "Admitted {} job {} on {} (timeout {} ms)",
            common.job_type, common.label, target, common.timeout_ms
        ));
        self.jobs.insert(target, Arc::new(Mutex::new(job)));
        Ok(())
    }

    /// Snapshot the selected tables and functions under a database read lock.
    fn build_database_meta(
        &self,
        db: &DatabaseInfo,
        request: &BackupRequest,
    ) -> Result<(Vec<TableRef>, BackupMeta)> {
        let catalog = self.ctx.catalog.as_ref();
        let _read = DatabaseReadGuard::new(catalog, db.id);

        let refs: Vec<TableRef> = if request.tables.is_empty() {
            catalog
                .list_tables(db.id)
                .into_iter()
                .filter(|name| {
                    catalog
                        .get_table(db.id, name)
                        .map(|t| t.kind.supports_backup_restore())
                        .unwrap_or(false)
                })
                .map(TableRef::new)
                .collect()
        } else {
            request.tables.clone()
        };

        let mut seen = BTreeSet::new();
        let mut tables = Vec::with_capacity(refs.len());
        for table_ref in &refs {
            if !seen.insert(table_ref.name.clone()) {
                return Err(BackupError::validation(format!(
                    "Duplicated table {} in backup",
                    table_ref.name
                )));
            }
            let table = catalog.get_table(db.id, &table_ref.name).ok_or_else(|| {
                BackupError::not_found(format!(
                    "Table {} does not exist in database {}",
                    table_ref.name, db.name
                ))
            })?;
            if !table.kind.supports_backup_restore() {
                return Err(BackupError::validation(format!(
                    "Table {} is an external table and does not support backup",
                    table.name
                )));
            }
            if table.has_temp_partitions {
                return Err(BackupError::validation(format!(
                    "Do not support backup table {} with temp partitions",
                    table.name
                )));
            }
            let partitions = match &table_ref.partitions {
                Some(p) if p.temp => {
                    return Err(BackupError::validation("Do not support backup temp partitions"));
                }
                Some(p) => Some(p.names.as_slice()),
                None => None,
            };
            let mut copy = table.selective_copy(partitions).ok_or_else(|| {
                BackupError::not_found(format!(
                    "Some partitions of table {} do not exist: {:?}",
                    table.name,
                    partitions.unwrap_or_default()
                ))
            })?;
            if copy.is_materialized_view() {
                copy.inactive_reason = Some(MV_BACKUP_INACTIVE_REASON.to_string());
            }
            tables.push(copy);
        }

        let mut meta = BackupMeta::new(tables);
        for function_ref in &request.functions {
            let functions = catalog.get_functions(db.id, &function_ref.name);
            if functions.is_empty() {
                return Err(BackupError::not_found(format!(
                    "Function {} does not exist",
                    function_ref.name
                )));
            }
            meta.functions.extend(functions);
        }
        Ok((refs, meta))
    }

    fn build_catalog_meta(&self, request: &BackupRequest) -> Result<BackupMeta> {
        let mut meta = BackupMeta::default();
        let mut seen = BTreeSet::new();
        for catalog_ref in &request.catalogs {
            if !seen.insert(catalog_ref.name.clone()) {
                return Err(BackupError::validation(format!(
                    "Duplicated external catalog {} in backup",
                    catalog_ref.name
                )));
            }
            let catalog = self
                .ctx
                .catalog
                .get_external_catalog(&catalog_ref.name)
                .ok_or_else(|| {
                    BackupError::not_found(format!(
                        "External catalog {} does not exist",
                        catalog_ref.name
                    ))
                })?;
            meta.catalogs.push(catalog);
        }
        Ok(meta)
    }
}
