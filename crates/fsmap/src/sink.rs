// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The record sink: a transactional writer that persists the normalized
//! record stream to SQLite and derives the overview histograms and
//! per-inode fragmentation statistics from it.
//!
//! The schema is stable and visible to downstream viewers; see the type
//! tables seeded below.

use rusqlite::{params, Connection};

use crate::record::{Extent, ExtentKind, InodeKind, InodeTimes, MAX_EXTENT_LENGTH};
use crate::{Error, Result, VolumeStats};

/// Session pragmas for a bulk load: we own the file exclusively and can
/// drop durability for the duration of the run.
const OP_SCHEMA: &str = "\
PRAGMA cache_size = 4096;\
PRAGMA mmap_size = 1073741824;\
PRAGMA journal_mode = MEMORY;\
PRAGMA synchronous = OFF;\
PRAGMA locking_mode = EXCLUSIVE;\
PRAGMA case_sensitive_like = ON;\
";

const DB_SCHEMA: &str = "\
PRAGMA page_size = 65536;\
PRAGMA application_id = 61270;\
PRAGMA journal_mode = MEMORY;\
DROP VIEW IF EXISTS dentry_t;\
DROP VIEW IF EXISTS path_extent_v;\
DROP VIEW IF EXISTS path_inode_v;\
DROP TABLE IF EXISTS overview_t;\
DROP TABLE IF EXISTS dentry_t;\
DROP TABLE IF EXISTS extent_t;\
DROP TABLE IF EXISTS extent_type_t;\
DROP TABLE IF EXISTS path_t;\
DROP TABLE IF EXISTS dir_t;\
DROP TABLE IF EXISTS inode_t;\
DROP TABLE IF EXISTS inode_type_t;\
DROP TABLE IF EXISTS fs_t;\
CREATE TABLE fs_t(path TEXT PRIMARY KEY NOT NULL, block_size INTEGER NOT NULL, frag_size INTEGER NOT NULL, total_bytes INTEGER NOT NULL, free_bytes INTEGER NOT NULL, avail_bytes INTEGER NOT NULL, total_inodes INTEGER NOT NULL, free_inodes INTEGER NOT NULL, avail_inodes INTEGER NOT NULL, max_len INTEGER NOT NULL, timestamp TEXT NOT NULL, finished INTEGER NOT NULL, path_separator TEXT NOT NULL);\
CREATE TABLE inode_type_t(id INTEGER PRIMARY KEY UNIQUE, code TEXT NOT NULL);\
INSERT INTO inode_type_t VALUES (0, 'f');\
INSERT INTO inode_type_t VALUES (1, 'd');\
INSERT INTO inode_type_t VALUES (2, 'm');\
INSERT INTO inode_type_t VALUES (3, 's');\
INSERT INTO inode_type_t VALUES (4, 'r');\
CREATE TABLE inode_t(ino INTEGER PRIMARY KEY UNIQUE NOT NULL, type INTEGER NOT NULL, nr_extents INTEGER, travel_score REAL, atime INTEGER, crtime INTEGER, ctime INTEGER, mtime INTEGER, size INTEGER, FOREIGN KEY(type) REFERENCES inode_type_t(id));\
CREATE TABLE dir_t(dir_ino INTEGER NOT NULL, name TEXT NOT NULL, name_ino INTEGER NOT NULL, FOREIGN KEY(dir_ino) REFERENCES inode_t(ino), FOREIGN KEY(name_ino) REFERENCES inode_t(ino));\
CREATE TABLE path_t(path TEXT PRIMARY KEY UNIQUE NOT NULL, ino INTEGER NOT NULL, FOREIGN KEY(ino) REFERENCES inode_t(ino));\
CREATE TABLE extent_type_t(id INTEGER PRIMARY KEY UNIQUE, code TEXT NOT NULL);\
INSERT INTO extent_type_t VALUES (0, 'f');\
INSERT INTO extent_type_t VALUES (1, 'd');\
INSERT INTO extent_type_t VALUES (2, 'e');\
INSERT INTO extent_type_t VALUES (3, 'm');\
INSERT INTO extent_type_t VALUES (4, 'x');\
INSERT INTO extent_type_t VALUES (5, 's');\
INSERT INTO extent_type_t VALUES (6, 'r');\
CREATE TABLE extent_t(ino INTEGER NOT NULL, p_off INTEGER NOT NULL, l_off INTEGER, flags INTEGER NOT NULL, length INTEGER NOT NULL, type INTEGER NOT NULL, p_end INTEGER NOT NULL, FOREIGN KEY(ino) REFERENCES inode_t(ino), FOREIGN KEY(type) REFERENCES extent_type_t(id));\
CREATE TABLE overview_t(length INTEGER NOT NULL, cell_no INTEGER NOT NULL, files INTEGER NOT NULL, dirs INTEGER NOT NULL, mappings INTEGER NOT NULL, metadata INTEGER NOT NULL, xattrs INTEGER NOT NULL, symlinks INTEGER NOT NULL, CONSTRAINT pk_overview PRIMARY KEY (length, cell_no));\
CREATE VIEW path_extent_v AS SELECT path_t.path, extent_t.p_off, extent_t.l_off, extent_t.length, extent_t.flags, extent_t.type, extent_t.p_end, extent_t.ino FROM extent_t, path_t WHERE extent_t.ino = path_t.ino;\
CREATE VIEW path_inode_v AS SELECT path_t.path, inode_t.ino, inode_t.type, inode_t.nr_extents, inode_t.travel_score, inode_t.atime, inode_t.crtime, inode_t.ctime, inode_t.mtime, inode_t.size FROM path_t, inode_t WHERE inode_t.ino = path_t.ino;\
CREATE VIEW dentry_t AS SELECT dir_t.dir_ino, dir_t.name, dir_t.name_ino, inode_t.type FROM dir_t, inode_t WHERE dir_t.name_ino = inode_t.ino;\
";

const DB_INDEX: &str = "\
CREATE INDEX inode_i ON inode_t(ino);\
CREATE INDEX path_ino_i ON path_t(ino);\
CREATE INDEX path_path_i ON path_t(path);\
CREATE INDEX dir_ino_i ON dir_t(dir_ino);\
CREATE INDEX dir_nino_i ON dir_t(name_ino);\
CREATE INDEX extent_poff_i ON extent_t(p_off, p_end);\
CREATE INDEX extent_loff_i ON extent_t(l_off, length);\
CREATE INDEX extent_ino_i ON extent_t(ino);\
CREATE INDEX extent_type_i ON extent_t(type);\
CREATE INDEX overview_cell_i ON overview_t(length, cell_no);\
";

/// Counts of each extent kind intersecting one histogram cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OverviewCell {
    files: u64,
    dirs: u64,
    mappings: u64,
    metadata: u64,
    xattrs: u64,
    symlinks: u64,
}

/// Transactional writer over the mapper database.
pub struct Sink {
    conn: Connection,
}

impl Sink {
    /// Open (or create) the database file.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// In-memory sink, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Apply operational pragmas and (re)create the schema, dropping any
    /// tables left over from an earlier run.
    pub fn prepare(&mut self) -> Result<()> {
        self.conn.execute_batch(OP_SCHEMA)?;
        self.conn.execute_batch(DB_SCHEMA)?;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("END TRANSACTION")?;
        Ok(())
    }

    /// Upsert one inode and its canonical path. Re-inserting the same
    /// identifier replaces the row, so hard links cost one inode row.
    pub fn insert_inode(
        &mut self,
        ino: i64,
        kind: InodeKind,
        path: &str,
        times: &InodeTimes,
        size: Option<u64>,
    ) -> Result<()> {
        log::debug!("inode: ino={ino} type={kind:?} path={path}");
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO inode_t VALUES(?, ?, NULL, NULL, ?, ?, ?, ?, ?)")?;
        stmt.execute(params![
            ino,
            kind.code(),
            times.atime,
            times.crtime,
            times.ctime,
            times.mtime,
            size.map(|s| s as i64),
        ])?;
        let mut stmt = self.conn.prepare_cached("INSERT INTO path_t VALUES(?, ?)")?;
        stmt.execute(params![path, ino])?;
        Ok(())
    }

    /// Append one directory entry.
    pub fn insert_dentry(&mut self, dir_ino: i64, name: &str, ino: i64) -> Result<()> {
        log::debug!("dentry: dir={dir_ino} name={name} ino={ino}");
        let mut stmt = self.conn.prepare_cached("INSERT INTO dir_t VALUES(?, ?, ?)")?;
        stmt.execute(params![dir_ino, name, ino])?;
        Ok(())
    }

    /// Append one extent. The inclusive physical end is derived here.
    pub fn insert_extent(&mut self, ext: &Extent) -> Result<()> {
        if ext.length == 0 || ext.length > MAX_EXTENT_LENGTH {
            return Err(Error::corrupt(format!(
                "extent length {} out of range for inode {}",
                ext.length, ext.ino
            )));
        }
        log::debug!(
            "extent: ino={} phys={} logical={:?} len={} flags={:#x} type={:?}",
            ext.ino,
            ext.physical,
            ext.logical,
            ext.length,
            ext.flags.bits(),
            ext.kind
        );
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO extent_t VALUES(?, ?, ?, ?, ?, ?, ?)")?;
        stmt.execute(params![
            ext.ino,
            ext.physical as i64,
            ext.logical.map(|l| l as i64),
            ext.flags.bits(),
            ext.length as i64,
            ext.kind.code(),
            ext.physical_end() as i64,
        ])?;
        Ok(())
    }

    /// Create one synthetic metadata inode plus the dentry binding it into
    /// the invented tree. `dir_path` is the parent's full path.
    pub fn inject_metadata(
        &mut self,
        parent_ino: i64,
        dir_path: &str,
        ino: i64,
        name: &str,
        kind: InodeKind,
    ) -> Result<()> {
        let path = format!("{dir_path}/{name}");
        self.insert_inode(ino, kind, &path, &InodeTimes::default(), None)?;
        self.insert_dentry(parent_ino, name, ino)
    }

    /// Record the volume statistics row, initially unfinished.
    pub fn collect_fs_stats(&mut self, stats: &VolumeStats) -> Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO fs_t VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)")?;
        stmt.execute(params![
            stats.path,
            stats.block_size,
            stats.frag_size,
            stats.total_bytes as i64,
            stats.free_bytes as i64,
            stats.avail_bytes as i64,
            stats.total_inodes as i64,
            stats.free_inodes as i64,
            stats.avail_inodes as i64,
            stats.max_name_len,
            timestamp,
            "/",
        ])?;
        Ok(())
    }

    /// Mark the run complete. Extents must not reach past the recorded
    /// volume size; if one does, the size is bumped above it.
    pub fn finalize_fs_stats(&mut self, fs_path: &str) -> Result<()> {
        self.conn
            .prepare_cached("UPDATE fs_t SET finished = 1 WHERE path = ?")?
            .execute(params![fs_path])?;

        let max_pend: Option<i64> =
            self.conn
                .query_row("SELECT MAX(p_end) FROM extent_t", [], |row| row.get(0))?;
        let Some(max_pend) = max_pend else {
            return Ok(());
        };
        let total_bytes: i64 = self
            .conn
            .query_row("SELECT total_bytes FROM fs_t", [], |row| row.get(0))?;
        if total_bytes <= max_pend {
            self.conn
                .prepare_cached("UPDATE fs_t SET total_bytes = ? WHERE path = ?")?
                .execute(params![max_pend + 1, fs_path])?;
        }
        Ok(())
    }

    /// Create the query indices and verify referential integrity.
    pub fn index_db(&mut self) -> Result<()> {
        self.conn.execute_batch(DB_INDEX)?;
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let table: String = row.get(0)?;
            return Err(Error::corrupt(format!("foreign key violation in {table}")));
        }
        Ok(())
    }

    /// Compute one overview histogram over physical offsets. Each cell
    /// counts, per extent kind, the extents intersecting it. A pure
    /// function of the extent table: recomputing replaces the rows.
    pub fn cache_overview(&mut self, length: u64) -> Result<()> {
        let total_bytes: i64 = self
            .conn
            .query_row("SELECT total_bytes FROM fs_t", [], |row| row.get(0))?;
        let bytes_per_cell = (total_bytes as u64).div_ceil(length).max(1);
        let mut cells = vec![OverviewCell::default(); length as usize];

        {
            let mut stmt = self.conn.prepare("SELECT p_off, p_end, type FROM extent_t")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let p_off: i64 = row.get(0)?;
                let p_end: i64 = row.get(1)?;
                let kind: i64 = row.get(2)?;
                let start = (p_off as u64 / bytes_per_cell).min(length - 1) as usize;
                let end = (p_end as u64 / bytes_per_cell).min(length - 1) as usize;
                for cell in &mut cells[start..=end] {
                    match kind {
                        0 => cell.files += 1,
                        1 => cell.dirs += 1,
                        2 => cell.mappings += 1,
                        3 => cell.metadata += 1,
                        4 => cell.xattrs += 1,
                        5 => cell.symlinks += 1,
                        // freespace extents are not part of the overview
                        _ => {}
                    }
                }
            }
        }

        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO overview_t VALUES (?, ?, ?, ?, ?, ?, ?, ?)")?;
        for (cell_no, cell) in cells.iter().enumerate() {
            stmt.execute(params![
                length as i64,
                cell_no as i64,
                cell.files as i64,
                cell.dirs as i64,
                cell.mappings as i64,
                cell.metadata as i64,
                cell.xattrs as i64,
                cell.symlinks as i64,
            ])?;
        }
        Ok(())
    }

    /// For each inode, count its primary-kind extents and compute a travel
    /// score: summed physical distance over summed logical distance across
    /// consecutive extents ordered by logical offset. 1.0 is perfectly
    /// contiguous; higher means more fragmented. Extents whose kind is not
    /// the inode's primary kind (mapping-tree and xattr extents) are left
    /// out of the accounting.
    pub fn calc_inode_stats(&mut self) -> Result<()> {
        let mut upd = self
            .conn
            .prepare("UPDATE inode_t SET nr_extents = ?, travel_score = ? WHERE ino = ?")?;
        let mut stmt = self.conn.prepare(
            "SELECT extent_t.ino, inode_t.type AS itype, extent_t.type AS etype, \
             p_off, l_off, length FROM extent_t INNER JOIN inode_t \
             WHERE extent_t.ino = inode_t.ino AND inode_t.ino IN \
             (SELECT ino FROM inode_t WHERE travel_score IS NULL OR nr_extents IS NULL) \
             ORDER BY extent_t.ino, l_off",
        )?;

        let mut rows = stmt.query([])?;
        let mut cur: Option<i64> = None;
        let mut extents: i64 = 0;
        let mut p_dist: i64 = 0;
        let mut l_dist: i64 = 0;
        let mut last_poff: i64 = 0;
        let mut last_loff: i64 = 0;

        while let Some(row) = rows.next()? {
            let ino: i64 = row.get(0)?;
            let itype: i64 = row.get(1)?;
            let etype: i64 = row.get(2)?;
            let p_off: i64 = row.get(3)?;
            let l_off: i64 = row.get::<_, Option<i64>>(4)?.unwrap_or(0);
            let length: i64 = row.get(5)?;

            let primary = match itype {
                0 => 0,
                1 => 1,
                2 => 3,
                3 => 5,
                4 => 6,
                _ => continue,
            };
            if etype != primary {
                continue;
            }

            if cur != Some(ino) {
                if let Some(prev) = cur {
                    let score = if l_dist > 0 { p_dist as f64 / l_dist as f64 } else { 0.0 };
                    upd.execute(params![extents, score, prev])?;
                }
                cur = Some(ino);
                extents = 0;
                p_dist = 0;
                l_dist = 0;
                last_poff = 0;
                last_loff = 0;
            }

            if extents > 0 {
                p_dist += (p_off - last_poff).abs();
                l_dist += l_off - last_loff;
            }
            extents += 1;
            p_dist += length;
            l_dist += length;
            last_poff = p_off + length - 1;
            last_loff = l_off + length - 1;
        }
        if let Some(prev) = cur {
            let score = if l_dist > 0 { p_dist as f64 / l_dist as f64 } else { 0.0 };
            upd.execute(params![extents, score, prev])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExtentFlags;

    fn stats() -> VolumeStats {
        VolumeStats {
            path: "/dev/test".into(),
            block_size: 4096,
            frag_size: 4096,
            total_bytes: 128 << 20,
            free_bytes: 100 << 20,
            avail_bytes: 100 << 20,
            total_inodes: 1024,
            free_inodes: 1000,
            avail_inodes: 1000,
            max_name_len: 255,
        }
    }

    fn file_extent(ino: i64, physical: u64, logical: u64, length: u64) -> Extent {
        Extent {
            ino,
            physical,
            logical: Some(logical),
            length,
            flags: ExtentFlags::empty(),
            kind: ExtentKind::File,
        }
    }

    fn loaded_sink() -> Sink {
        let mut sink = Sink::open_in_memory().unwrap();
        sink.prepare().unwrap();
        sink.begin().unwrap();
        sink.collect_fs_stats(&stats()).unwrap();
        sink.insert_inode(2, InodeKind::Dir, "", &InodeTimes::default(), None)
            .unwrap();
        sink.insert_inode(12, InodeKind::File, "/a.bin", &InodeTimes::default(), Some(10 << 20))
            .unwrap();
        sink.insert_dentry(2, "a.bin", 12).unwrap();
        sink
    }

    #[test_log::test]
    fn prepare_is_reentrant() {
        let mut sink = Sink::open_in_memory().unwrap();
        sink.prepare().unwrap();
        sink.prepare().unwrap();
    }

    #[test_log::test]
    fn schema_is_seeded() {
        let sink = {
            let mut s = Sink::open_in_memory().unwrap();
            s.prepare().unwrap();
            s
        };
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM inode_type_t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 5);
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM extent_type_t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 7);
    }

    #[test_log::test]
    fn inode_insert_is_idempotent() {
        let mut sink = loaded_sink();
        // Re-inserting the same ino must replace, not error; the path
        // table is strict about duplicates though.
        sink.conn
            .execute(
                "INSERT OR REPLACE INTO inode_t VALUES(12, 0, NULL, NULL, NULL, NULL, NULL, NULL, NULL)",
                [],
            )
            .unwrap();
        let n: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM inode_t WHERE ino = 12", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        assert!(sink
            .insert_inode(12, InodeKind::File, "/a.bin", &InodeTimes::default(), None)
            .is_err());
    }

    #[test_log::test]
    fn extent_length_bounds_are_enforced() {
        let mut sink = loaded_sink();
        assert!(sink.insert_extent(&file_extent(12, 0, 0, 0)).is_err());
        assert!(sink
            .insert_extent(&file_extent(12, 0, 0, MAX_EXTENT_LENGTH + 1))
            .is_err());
        sink.insert_extent(&file_extent(12, 4096, 0, 4096)).unwrap();
    }

    #[test_log::test]
    fn p_end_is_inclusive() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, 4096, 0, 10 << 20)).unwrap();
        let p_end: i64 = sink
            .connection()
            .query_row("SELECT p_end FROM extent_t WHERE ino = 12", [], |r| r.get(0))
            .unwrap();
        assert_eq!(p_end, 4096 + (10 << 20) - 1);
    }

    #[test_log::test]
    fn finalize_bumps_total_bytes_above_extents() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, (128 << 20) - 4096, 0, 2 << 20))
            .unwrap();
        sink.finalize_fs_stats("/dev/test").unwrap();
        let (total, finished): (i64, i64) = sink
            .connection()
            .query_row("SELECT total_bytes, finished FROM fs_t", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(finished, 1);
        let max_pend = ((128 << 20) - 4096) + (2 << 20) - 1;
        assert_eq!(total, max_pend + 1);
    }

    #[test_log::test]
    fn index_passes_foreign_key_check() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, 4096, 0, 4096)).unwrap();
        sink.commit().unwrap();
        sink.index_db().unwrap();
    }

    #[test_log::test]
    fn index_detects_dangling_references() {
        let mut sink = loaded_sink();
        sink.conn
            .execute("INSERT INTO dir_t VALUES (2, 'ghost', 999)", [])
            .unwrap();
        sink.commit().unwrap();
        assert!(sink.index_db().is_err());
    }

    #[test_log::test]
    fn overview_counts_intersected_cells() {
        let mut sink = loaded_sink();
        // 128 MiB volume, 2048 cells -> 65536 bytes per cell
        sink.insert_extent(&file_extent(12, 0, 0, 65536 * 3)).unwrap();
        sink.cache_overview(2048).unwrap();
        let covered: i64 = sink
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM overview_t WHERE length = 2048 AND files > 0",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(covered, 3);
        let rows: i64 = sink
            .connection()
            .query_row("SELECT COUNT(*) FROM overview_t WHERE length = 2048", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2048);
    }

    #[test_log::test]
    fn overview_is_a_pure_function_of_extents() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, 123456, 0, 7 << 20)).unwrap();
        sink.cache_overview(2048).unwrap();
        let before: Vec<(i64, i64)> = {
            let mut stmt = sink
                .connection()
                .prepare("SELECT cell_no, files FROM overview_t ORDER BY cell_no")
                .unwrap();
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap();
            rows
        };
        sink.cache_overview(2048).unwrap();
        let after: Vec<(i64, i64)> = {
            let mut stmt = sink
                .connection()
                .prepare("SELECT cell_no, files FROM overview_t ORDER BY cell_no")
                .unwrap();
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap();
            rows
        };
        assert_eq!(before, after);
    }

    #[test_log::test]
    fn extent_at_volume_end_lands_in_last_cell() {
        let mut sink = loaded_sink();
        let total = 128u64 << 20;
        sink.insert_extent(&file_extent(12, total - 4096, 0, 4096)).unwrap();
        sink.cache_overview(2048).unwrap();
        let files: i64 = sink
            .connection()
            .query_row(
                "SELECT files FROM overview_t WHERE length = 2048 AND cell_no = 2047",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(files, 1);
    }

    #[test_log::test]
    fn travel_score_contiguous_is_one() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, 4096, 0, 4096)).unwrap();
        sink.insert_extent(&file_extent(12, 1 << 20, 4096, 4096)).unwrap();
        sink.calc_inode_stats().unwrap();
        let (nr, score): (i64, f64) = sink
            .connection()
            .query_row(
                "SELECT nr_extents, travel_score FROM inode_t WHERE ino = 12",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(nr, 2);
        // Far-apart extents travel much further physically than logically
        assert!(score > 1.0);

        // A single contiguous extent scores exactly 1.0
        sink.insert_inode(13, InodeKind::File, "/b.bin", &InodeTimes::default(), None)
            .unwrap();
        sink.insert_extent(&file_extent(13, 8 << 20, 0, 10 << 20)).unwrap();
        sink.calc_inode_stats().unwrap();
        let score: f64 = sink
            .connection()
            .query_row("SELECT travel_score FROM inode_t WHERE ino = 13", [], |r| r.get(0))
            .unwrap();
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test_log::test]
    fn non_primary_extents_are_excluded_from_stats() {
        let mut sink = loaded_sink();
        sink.insert_extent(&file_extent(12, 4096, 0, 4096)).unwrap();
        let mut map_ext = file_extent(12, 1 << 21, 0, 4096);
        map_ext.kind = ExtentKind::ExtentMap;
        sink.insert_extent(&map_ext).unwrap();
        sink.calc_inode_stats().unwrap();
        let nr: i64 = sink
            .connection()
            .query_row("SELECT nr_extents FROM inode_t WHERE ino = 12", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nr, 1);
    }

    #[test_log::test]
    fn inject_metadata_builds_path() {
        let mut sink = loaded_sink();
        sink.inject_metadata(2, "", -1, "$metadata", InodeKind::Dir).unwrap();
        sink.inject_metadata(-1, "/$metadata", -2, "superblocks", InodeKind::Metadata)
            .unwrap();
        let ino: i64 = sink
            .connection()
            .query_row("SELECT ino FROM path_t WHERE path = '/$metadata/superblocks'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(ino, -2);
    }
}
