//!
//! hydrolens catalog module
//! ------------------------
//! Process-wide, read-mostly state shared by every request: the bidirectional
//! real<->alias name directory loaded from the project's lookup database, the
//! per-(database, table) schema cache, and the paths discovered while
//! scanning the project folder tree (scenario databases, the lookup store and
//! the BMP database used for field-scale re-aggregation).
//!
//! Nothing here is global: the owning `ProjectContext` is created once and
//! handed to each operation as `SharedContext`, with interior `RwLock`s
//! guarding the mutable parts.

pub mod scan;
pub mod schema_cache;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AppResult;
use schema_cache::SchemaCache;

/// One table known to the alias directory, keyed by either its real or its
/// alias name. `columns` maps from the key's form to the other form, so the
/// same real column name may alias differently in different tables.
#[derive(Debug, Clone, Default)]
pub struct AliasEntry {
    /// Set when this entry is keyed by the alias name.
    pub real: Option<String>,
    /// Set when this entry is keyed by the real name.
    pub alias: Option<String>,
    pub columns: HashMap<String, String>,
}

/// Bidirectional table/column name directory. Resolution of any name absent
/// from the directory is the identity function: unmapped internal names are
/// assumed already canonical.
#[derive(Debug, Default)]
pub struct AliasDirectory {
    map: RwLock<HashMap<String, AliasEntry>>,
}

impl AliasDirectory {
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Alias table name -> real table name (pass-through when unmapped).
    pub fn resolve_table(&self, name: &str) -> String {
        self.map
            .read()
            .get(name)
            .and_then(|e| e.real.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Real table name -> alias table name (pass-through when unmapped).
    pub fn table_alias(&self, real: &str) -> String {
        self.map
            .read()
            .get(real)
            .and_then(|e| e.alias.clone())
            .unwrap_or_else(|| real.to_string())
    }

    /// Column translation scoped to one table key (real or alias form).
    pub fn resolve_column(&self, table: &str, column: &str) -> String {
        self.map
            .read()
            .get(table)
            .and_then(|e| e.columns.get(column).cloned())
            .unwrap_or_else(|| column.to_string())
    }

    /// The column map registered under a table key, if any.
    pub fn column_map(&self, table: &str) -> HashMap<String, String> {
        self.map.read().get(table).map(|e| e.columns.clone()).unwrap_or_default()
    }

    /// Register one lookup row: forward and backward mappings for both the
    /// table pair and the column pair.
    pub fn register(&self, real_table: &str, alias_table: &str, real_column: &str, alias_column: &str) {
        let mut map = self.map.write();
        let fwd = map.entry(real_table.to_string()).or_default();
        fwd.alias.get_or_insert_with(|| alias_table.to_string());
        fwd.columns.insert(real_column.to_string(), alias_column.to_string());
        let bwd = map.entry(alias_table.to_string()).or_default();
        bwd.real.get_or_insert_with(|| real_table.to_string());
        bwd.columns.insert(alias_column.to_string(), real_column.to_string());
    }

    /// Load the directory from the lookup database, reading one lookup table
    /// per scenario database stem. A load failure leaves the directory empty
    /// (pass-through resolution everywhere) and is never fatal.
    pub fn load_from_lookup(&self, lookup_path: &Path, db_stems: &[String]) {
        if !self.is_empty() {
            return;
        }
        match self.read_lookup(lookup_path, db_stems) {
            Ok(rows) => {
                for (rt, at, rc, ac) in &rows {
                    self.register(rt, at, rc, ac);
                }
                debug!(target: "hydrolens::catalog", "alias directory loaded: {} rows from '{}'", rows.len(), lookup_path.display());
            }
            Err(e) => {
                warn!(target: "hydrolens::catalog", "alias directory load failed, names pass through unmapped: {}", e);
            }
        }
    }

    fn read_lookup(
        &self,
        lookup_path: &Path,
        db_stems: &[String],
    ) -> AppResult<Vec<(String, String, String, String)>> {
        let conn = rusqlite::Connection::open(lookup_path)?;
        let mut rows_out = Vec::new();
        for stem in db_stems {
            let sql = format!(
                "SELECT \"Table Name\", \"Table Alias\", \"Column Name\", \"Column Alias\" FROM {}",
                quote_ident(stem)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                rows_out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
            }
        }
        Ok(rows_out)
    }
}

/// Quote a SQL identifier, doubling any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Default)]
struct DiscoveredPaths {
    lookup_db: Option<PathBuf>,
    bmp_db: Option<String>,
    databases: BTreeSet<PathBuf>,
}

/// Explicitly-owned, injected request context: configuration plus the shared
/// directory/cache state every pipeline stage consults.
pub struct ProjectContext {
    pub config: Config,
    pub alias: AliasDirectory,
    pub schema_cache: SchemaCache,
    paths: RwLock<DiscoveredPaths>,
}

pub type SharedContext = Arc<ProjectContext>;

impl ProjectContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            alias: AliasDirectory::default(),
            schema_cache: SchemaCache::default(),
            paths: RwLock::new(DiscoveredPaths::default()),
        }
    }

    pub fn shared(config: Config) -> SharedContext {
        Arc::new(Self::new(config))
    }

    /// Resolve a request-supplied database path under the data root.
    pub fn db_path(&self, rel: &str) -> AppResult<PathBuf> {
        self.config.resolve(rel)
    }

    pub fn lookup_db(&self) -> Option<PathBuf> {
        self.paths.read().lookup_db.clone()
    }

    pub fn set_lookup_db(&self, path: PathBuf) {
        self.paths.write().lookup_db = Some(path);
    }

    /// Relative path of the BMP database holding the Subarea table.
    pub fn bmp_db(&self) -> Option<String> {
        self.paths.read().bmp_db.clone()
    }

    pub fn set_bmp_db(&self, rel: String) {
        self.paths.write().bmp_db = Some(rel);
    }

    pub fn register_database(&self, path: PathBuf) {
        self.paths.write().databases.insert(path);
    }

    pub fn database_stems(&self) -> Vec<String> {
        self.paths
            .read()
            .databases
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_names_pass_through() {
        let dir = AliasDirectory::default();
        assert_eq!(dir.resolve_table("Reach"), "Reach");
        assert_eq!(dir.table_alias("rch_01"), "rch_01");
        assert_eq!(dir.resolve_column("Reach", "Q_OUT"), "Q_OUT");
    }

    #[test]
    fn alias_round_trip() {
        let dir = AliasDirectory::default();
        dir.register("rch_01", "Reach", "qo", "Flow");
        dir.register("rch_01", "Reach", "qb", "Baseflow");
        // table round trip both directions
        assert_eq!(dir.resolve_table(&dir.table_alias("rch_01")), "rch_01");
        assert_eq!(dir.table_alias(&dir.resolve_table("Reach")), "Reach");
        // column maps are scoped per table key form
        assert_eq!(dir.resolve_column("Reach", "Flow"), "qo");
        assert_eq!(dir.resolve_column("rch_01", "qo"), "Flow");
        assert_eq!(dir.resolve_column("Reach", &dir.resolve_column("rch_01", "qb")), "qb");
    }

    #[test]
    fn same_real_column_can_alias_differently_per_table() {
        let dir = AliasDirectory::default();
        dir.register("rch_01", "Reach", "q", "Flow");
        dir.register("sub_01", "Subarea", "q", "Runoff");
        assert_eq!(dir.resolve_column("rch_01", "q"), "Flow");
        assert_eq!(dir.resolve_column("sub_01", "q"), "Runoff");
    }

    #[test]
    fn load_failure_degrades_to_empty() {
        let dir = AliasDirectory::default();
        dir.load_from_lookup(Path::new("/nonexistent/lookup.db3"), &["scenario".to_string()]);
        assert!(dir.is_empty());
        assert_eq!(dir.resolve_table("Reach"), "Reach");
    }
}
