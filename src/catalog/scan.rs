//! Project folder scan: builds the file/folder listing served to the viewer
//! and discovers the databases the engine needs (scenario stores, the alias
//! lookup store, the BMP database). The first scan that finds a lookup store
//! also loads the alias directory.

use std::path::Path;

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use super::ProjectContext;
use crate::error::{AppError, AppResult};

/// File extensions surfaced to the viewer; intermediate reprojection
/// artifacts are hidden.
const LISTED_EXTENSIONS: [&str; 4] = [".shp", ".db3", ".tif", ".tiff"];

#[derive(Debug, Clone, Serialize)]
pub struct FileNode {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
}

fn listed(name: &str) -> bool {
    if name.ends_with("reprojected.tif") {
        return false;
    }
    LISTED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

fn rel_name(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}

/// Walk the project folder, classify entries, and register discovered
/// databases on the context. Returns the listing in walk order.
pub fn scan_project(ctx: &ProjectContext, folder_path: &str) -> AppResult<Vec<FileNode>> {
    let base = &ctx.config.data_root;
    let root = ctx.config.resolve(folder_path)?;
    if !root.is_dir() {
        return Err(AppError::io(
            "missing_folder".to_string(),
            format!("Project folder '{}' does not exist", folder_path),
        ));
    }

    let mut nodes: Vec<FileNode> = Vec::new();
    let mut lookup_found = false;

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| AppError::io("walk_error".to_string(), e.to_string()))?;
        let name = rel_name(base, entry.path());
        if entry.file_type().is_dir() {
            nodes.push(FileNode { kind: "folder", name });
            continue;
        }
        if !listed(&name) {
            continue;
        }
        let is_db = name.ends_with(".db3");
        if is_db {
            if name.contains("lookup") {
                ctx.set_lookup_db(entry.path().to_path_buf());
                lookup_found = true;
            } else {
                ctx.register_database(entry.path().to_path_buf());
            }
            if name.to_lowercase().contains("bmp") {
                ctx.set_bmp_db(name.clone());
            }
        }
        nodes.push(FileNode { kind: if is_db { "database" } else { "file" }, name });
    }

    // Load alias mapping once per process, the first time a lookup store is seen.
    if lookup_found && ctx.alias.is_empty() {
        if let Some(lookup) = ctx.lookup_db() {
            let stems = ctx.database_stems();
            ctx.alias.load_from_lookup(&lookup, &stems);
        }
    }

    debug!(target: "hydrolens::catalog", "scan '{}': {} entries, lookup_found={}", folder_path, nodes.len(), lookup_found);
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn scan_classifies_and_filters_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        touch(&root.join("scenario_1/out.db3"));
        touch(&root.join("scenario_1/reach.shp"));
        touch(&root.join("scenario_1/elevation_reprojected.tif"));
        touch(&root.join("notes.txt"));

        let ctx = ProjectContext::new(Config::with_root(tmp.path()));
        let nodes = scan_project(&ctx, "proj").unwrap();

        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"proj/scenario_1"));
        assert!(names.contains(&"proj/scenario_1/out.db3"));
        assert!(names.contains(&"proj/scenario_1/reach.shp"));
        assert!(!names.iter().any(|n| n.ends_with("reprojected.tif")));
        assert!(!names.iter().any(|n| n.ends_with("notes.txt")));

        let db = nodes.iter().find(|n| n.name.ends_with("out.db3")).unwrap();
        assert_eq!(db.kind, "database");
        let folder = nodes.iter().find(|n| n.name == "proj/scenario_1").unwrap();
        assert_eq!(folder.kind, "folder");
    }

    #[test]
    fn scan_discovers_lookup_and_bmp_databases() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        touch(&root.join("lookup.db3"));
        touch(&root.join("BMP.db3"));
        touch(&root.join("out.db3"));

        let ctx = ProjectContext::new(Config::with_root(tmp.path()));
        scan_project(&ctx, "proj").unwrap();

        assert_eq!(ctx.lookup_db().unwrap(), root.join("lookup.db3"));
        assert_eq!(ctx.bmp_db().unwrap(), "proj/BMP.db3");
        assert_eq!(ctx.database_stems(), vec!["BMP".to_string(), "out".to_string()]);
    }

    #[test]
    fn scan_without_lookup_leaves_directory_empty() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("proj/out.db3"));
        let ctx = ProjectContext::new(Config::with_root(tmp.path()));
        scan_project(&ctx, "proj").unwrap();
        assert!(ctx.alias.is_empty());
    }
}
