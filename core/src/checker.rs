use crate::backend::object_basename;
use crate::index::{Index, load_index_files};
use crate::pack::{self, PackHeader};
use crate::repository::Repository;
use crate::snapshot::Tree;
use crate::{ChunkID, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckDepth {
    /// Structure, pack headers and every blob reachable from a snapshot.
    #[default]
    Default,
    /// Additionally decrypts every blob of every pack.
    ReadData,
}

/// Outcome of a check. Each entry in `errors` is one inconsistency.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub snapshots_checked: u64,
    pub trees_checked: u64,
    pub blobs_checked: u64,
    pub packs_checked: u64,
}

impl CheckReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: String) {
        warn!(%message, "Check found an error");
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        debug!(%message, "Check warning");
        self.warnings.push(message);
    }
}

pub(crate) struct Checker<'a> {
    repo: &'a Repository,
    depth: CheckDepth,
}

impl<'a> Checker<'a> {
    pub(crate) fn new(repo: &'a Repository, depth: CheckDepth) -> Self {
        Self { repo, depth }
    }

    /// Only listing failures abort the check; everything else is counted.
    pub(crate) async fn run(&self) -> Result<CheckReport> {
        let mut report = CheckReport::default();

        let index = self.check_index_files(&mut report).await?;
        self.check_packs(&index, &mut report).await?;
        self.check_snapshots(&mut report).await?;

        info!(
            errors = report.error_count(),
            warnings = report.warnings.len(),
            snapshots = report.snapshots_checked,
            trees = report.trees_checked,
            blobs = report.blobs_checked,
            packs = report.packs_checked,
            "Check complete"
        );
        Ok(report)
    }

    /// Rebuilds the index from storage, counting unreadable index objects.
    async fn check_index_files(&self, report: &mut CheckReport) -> Result<Index> {
        let store = self.repo.store();
        let mut index = Index::new();
        for (name, file) in load_index_files(store.backend().as_ref(), store.encryptor()).await? {
            match file {
                Ok(file) => index.add_index_file(&file),
                Err(e) => report.error(format!("index {}: {}", object_basename(&name), e)),
            }
        }
        Ok(index)
    }

    async fn check_packs(&self, index: &Index, report: &mut CheckReport) -> Result<()> {
        let store = self.repo.store();
        let backend = store.backend();
        let names = backend.list("data").await?;
        let present: HashSet<&str> = names.iter().map(|n| object_basename(n)).collect();

        for pack_id in index.packs.keys() {
            if !present.contains(pack_id.as_str()) {
                report.error(format!("pack {}: referenced by index but missing", pack_id));
            }
        }

        for name in &names {
            let pack_id = object_basename(name).to_string();
            let data = match backend.read(name).await {
                Ok(data) => data,
                Err(e) => {
                    report.error(format!("pack {}: {}", pack_id, e));
                    continue;
                }
            };
            let header = match pack::read_header(store.encryptor(), &pack_id, &data) {
                Ok(header) => header,
                Err(e) => {
                    report.error(format!("pack {}: {}", pack_id, e));
                    continue;
                }
            };
            report.packs_checked += 1;

            if !index.packs.contains_key(&pack_id) {
                report.warning(format!("pack {}: not referenced by any index", pack_id));
            }
            self.check_pack_entries(&pack_id, &header, index, report);

            if self.depth == CheckDepth::ReadData {
                for entry in &header.entries {
                    let start = entry.offset as usize;
                    let sealed = &data[start..start + entry.length as usize];
                    if let Err(e) = pack::decode_blob(store.encryptor(), &entry.id, sealed, name) {
                        report.error(e.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn check_pack_entries(&self, pack_id: &str, header: &PackHeader, index: &Index, report: &mut CheckReport) {
        for entry in &header.entries {
            match index.get_chunk(&entry.id) {
                None => report.error(format!(
                    "pack {}: blob {} is not indexed",
                    pack_id,
                    entry.id.short_string()
                )),
                Some(meta) if meta.pack_id != pack_id => report.warning(format!(
                    "blob {} stored in pack {} and pack {}",
                    entry.id.short_string(),
                    meta.pack_id,
                    pack_id
                )),
                Some(meta) if meta.offset != entry.offset || meta.length != entry.length => report.error(format!(
                    "pack {}: index location of blob {} disagrees with pack header",
                    pack_id,
                    entry.id.short_string()
                )),
                Some(_) => {}
            }
        }
    }

    /// Walks every snapshot's trees and verifies each distinct blob once,
    /// up to `parallelism` blobs at a time.
    async fn check_snapshots(&self, report: &mut CheckReport) -> Result<()> {
        let manager = self.repo.snapshot_manager();
        let store = self.repo.store();
        let mut seen_trees: HashSet<ChunkID> = HashSet::new();
        let mut seen_blobs: HashSet<ChunkID> = HashSet::new();

        for id in manager.list_ids().await? {
            let snapshot = match manager.load(&id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    report.error(format!("snapshot {}: {}", id, e));
                    continue;
                }
            };
            report.snapshots_checked += 1;

            let mut pending = vec![(snapshot.tree, String::from("/"))];
            while let Some((tree_id, path)) = pending.pop() {
                if !seen_trees.insert(tree_id) {
                    continue;
                }
                let tree = match store.get_blob(&tree_id).await {
                    Ok(data) => Tree::from_bytes(&data, &format!("tree {}", tree_id.short_string())),
                    Err(e) => Err(e),
                };
                let tree = match tree {
                    Ok(tree) => tree,
                    Err(e) => {
                        report.error(format!("snapshot {}: tree {} at {}: {}", snapshot.short_id(), tree_id.short_string(), path, e));
                        continue;
                    }
                };
                report.trees_checked += 1;

                let mut blobs = Vec::new();
                for node in &tree.nodes {
                    let node_path = format!("{}{}", path, node.name);
                    if node.is_dir() {
                        match node.subtree_id {
                            Some(subtree) => pending.push((subtree, format!("{}/", node_path))),
                            None => report.error(format!("{}: directory without subtree", node_path)),
                        }
                        continue;
                    }
                    for blob in &node.content {
                        if seen_blobs.insert(*blob) {
                            blobs.push((node_path.clone(), *blob));
                        }
                    }
                }

                report.blobs_checked += blobs.len() as u64;
                let mut results = stream::iter(blobs)
                    .map(|(node_path, blob)| async move {
                        let result = store.get_blob(&blob).await;
                        (node_path, blob, result)
                    })
                    .buffer_unordered(self.repo.parallelism());
                while let Some((node_path, blob, result)) = results.next().await {
                    if let Err(e) = result {
                        report.error(format!("{}: blob {}: {}", node_path, blob.short_string(), e));
                    }
                }
            }
        }
        Ok(())
    }
}
