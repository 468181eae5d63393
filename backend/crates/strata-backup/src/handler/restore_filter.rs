//! Narrow a snapshot's manifest and meta to what a restore request selects.

use std::collections::BTreeSet;

use strata_commons::TableKind;

use crate::error::{BackupError, Result};
use crate::manifest::BackupJobInfo;
use crate::meta::BackupMeta;
use crate::request::{RestoreRequest, RestoreSelection};

/// Name of the built-in catalog; restored catalogs may not take it.
pub(crate) const DEFAULT_CATALOG: &str = "default_catalog";

/// Apply the request's selection clause and alias rules.
///
/// Tables and partitions are narrowed in the manifest, functions and
/// catalogs in the meta. A missing meta passes through as `None`.
pub(crate) fn filter_snapshot(
    mut info: BackupJobInfo,
    mut meta: Option<BackupMeta>,
    request: &RestoreRequest,
) -> Result<(BackupJobInfo, Option<BackupMeta>)> {
    if info.is_external_catalog_snapshot() {
        filter_catalogs(&mut meta, request)?;
        info.tables.clear();
        return Ok((info, meta));
    }

    if !request.catalogs.is_empty() || request.all_catalogs {
        return Err(BackupError::validation(format!(
            "Snapshot {} holds database {} and has no external catalogs to restore",
            info.name, info.db_name
        )));
    }

    let selection = &request.selection;
    if !selection.explicit {
        return Ok((info, meta));
    }

    let kept = filter_tables(&mut info, meta.as_ref(), selection)?;
    if let Some(meta) = meta.as_mut() {
        meta.tables.retain(|name, _| kept.contains(name));
        filter_functions(meta, selection)?;
        meta.catalogs.clear();
    }
    Ok((info, meta))
}

/// Returns the snapshot names of the tables that stay in scope.
fn filter_tables(
    info: &mut BackupJobInfo,
    meta: Option<&BackupMeta>,
    selection: &RestoreSelection,
) -> Result<BTreeSet<String>> {
    let mut kept = BTreeSet::new();
    let mut targets = BTreeSet::new();

    for table_ref in &selection.tables {
        if table_ref.partitions.as_ref().map(|p| p.temp).unwrap_or(false) {
            return Err(BackupError::validation("Do not support restoring temporary partitions"));
        }
        let snapshot_name = info.name.clone();
        let table_info = info.table_info_mut(&table_ref.name).ok_or_else(|| {
            BackupError::not_found(format!(
                "Table {} not found in snapshot {}",
                table_ref.name, snapshot_name
            ))
        })?;
        if let Some(partitions) = &table_ref.partitions {
            if let Some(missing) = partitions
                .names
                .iter()
                .find(|p| !table_info.contains_partition(p))
            {
                return Err(BackupError::not_found(format!(
                    "Partition {} of table {} not found in snapshot {}",
                    missing, table_ref.name, snapshot_name
                )));
            }
            table_info.retain_partitions(Some(&partitions.names));
        }
        table_info.alias = table_ref.alias.clone();

        if !kept.insert(table_ref.name.clone()) {
            return Err(BackupError::validation(format!(
                "Table {} is selected more than once",
                table_ref.name
            )));
        }
        if !targets.insert(table_ref.target_name().to_string()) {
            return Err(BackupError::validation(format!(
                "Duplicated restore table name {}",
                table_ref.target_name()
            )));
        }
    }

    let pulls_kind = |kind: TableKind| match kind {
        TableKind::Olap => selection.all_tables,
        TableKind::MaterializedView => selection.all_mvs,
        TableKind::View => selection.all_views,
        TableKind::External => false,
    };
    if let Some(meta) = meta {
        for (name, table) in &meta.tables {
            if kept.contains(name) || targets.contains(name) || !pulls_kind(table.kind) {
                continue;
            }
            if info.contains_table(name) {
                kept.insert(name.clone());
                targets.insert(name.clone());
            }
        }
    }

    info.retain_tables(&kept);
    Ok(kept)
}

fn filter_functions(meta: &mut BackupMeta, selection: &RestoreSelection) -> Result<()> {
    let mut kept = Vec::new();
    for function_ref in &selection.functions {
        let matching: Vec<_> = meta
            .functions
            .iter()
            .filter(|f| function_ref.matches(&f.name))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(BackupError::not_found(format!(
                "Function {} not found in snapshot",
                function_ref.name
            )));
        }
        for mut function in matching {
            if let Some(alias) = &function_ref.alias {
                function.name.function = alias.clone();
            }
            kept.push(function);
        }
    }

    if selection.all_functions {
        let rest: Vec<_> = meta
            .functions
            .iter()
            .filter(|f| !selection.functions.iter().any(|r| r.matches(&f.name)))
            .filter(|f| {
                !kept
                    .iter()
                    .any(|k| k.name.function.eq_ignore_ascii_case(&f.name.function))
            })
            .cloned()
            .collect();
        kept.extend(rest);
    }

    meta.functions = kept;
    Ok(())
}

fn filter_catalogs(meta: &mut Option<BackupMeta>, request: &RestoreRequest) -> Result<()> {
    if request.db_name.is_some() {
        return Err(BackupError::validation(
            "An external catalog snapshot cannot be restored into a database",
        ));
    }
    if let Some(catalog) = request
        .catalogs
        .iter()
        .find(|c| c.alias.as_deref() == Some(DEFAULT_CATALOG))
    {
        return Err(BackupError::validation(format!(
            "Do not support set alias of catalog {} as {}",
            catalog.name, DEFAULT_CATALOG
        )));
    }

    let Some(meta) = meta.as_mut() else {
        return Ok(());
    };
    meta.tables.clear();
    meta.functions.clear();
    if request.all_catalogs {
        return Ok(());
    }

    let mut kept = Vec::with_capacity(request.catalogs.len());
    let mut names = BTreeSet::new();
    for catalog_ref in &request.catalogs {
        let mut catalog = meta
            .catalogs
            .iter()
            .find(|c| c.name == catalog_ref.name)
            .cloned()
            .ok_or_else(|| {
                BackupError::not_found(format!(
                    "External catalog {} not found in snapshot",
                    catalog_ref.name
                ))
            })?;
        if let Some(alias) = &catalog_ref.alias {
            catalog.name = alias.clone();
        }
        if !names.insert(catalog.name.clone()) {
            return Err(BackupError::validation(format!(
                "Duplicated restore catalog name {}",
                catalog.name
            )));
        }
        kept.push(catalog);
    }
    meta.catalogs = kept;
    Ok(())
}
