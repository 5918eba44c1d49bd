//! Authoritative filesystem store.
//!
//! Every entity lives in its own directory, `<root>/<kind>/<id>/`:
//!
//! - `meta.json`: the entity document
//! - `link.json`: link details (bookmarks only)
//! - `deleted.json`: the deletion marker, present only for deleted entities
//! - `readable/v<N>.md`, `assets/<assetId>.<ext>`, `highlights/<id>.json`:
//!   bookmark auxiliary files indexed by the cache
//!
//! Writes go through a sibling temp file and a rename, so a reader never sees
//! a half-written document. A [`WriteJournal`] undoes a batch of writes whose
//! database transaction did not commit.

use crate::error::{StorageError, StorageResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use yaba_types::{
    Asset, Bookmark, Entity, EntityId, EntityKind, Folder, Highlight, LinkDetail, ReadableVersion,
    Tag, Timestamp, Tombstone,
};

const META_FILE: &str = "meta.json";
const LINK_FILE: &str = "link.json";
const TOMBSTONE_FILE: &str = "deleted.json";
const READABLE_DIR: &str = "readable";
const ASSETS_DIR: &str = "assets";
const HIGHLIGHTS_DIR: &str = "highlights";

/// Auxiliary files found under one bookmark, as indexed by the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkAux {
    pub readable_versions: Vec<ReadableVersion>,
    pub assets: Vec<Asset>,
    pub highlights: Vec<Highlight>,
}

/// Per-entity JSON documents on disk, keyed by kind and id.
#[derive(Debug, Clone)]
pub struct EntityStore {
    root: PathBuf,
}

impl EntityStore {
    /// Opens (or creates) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        for kind in EntityKind::ALL {
            fs::create_dir_all(root.join(kind.dir_name()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds everything about one entity.
    pub fn entity_dir(&self, kind: EntityKind, id: EntityId) -> PathBuf {
        self.root.join(kind.dir_name()).join(id.to_string())
    }

    // ── Documents ────────────────────────────────────────────────

    /// Reads an entity's canonical document.
    ///
    /// Returns `None` when there is no document, whether the entity never
    /// existed or has been deleted. Use [`is_deleted`](Self::is_deleted) to
    /// tell the two apart.
    pub fn read(&self, kind: EntityKind, id: EntityId) -> StorageResult<Option<Entity>> {
        let dir = self.entity_dir(kind, id);
        let entity = match kind {
            EntityKind::Folder => read_json::<Folder>(&dir.join(META_FILE))?.map(Entity::Folder),
            EntityKind::Tag => read_json::<Tag>(&dir.join(META_FILE))?.map(Entity::Tag),
            EntityKind::Bookmark => match read_json::<Bookmark>(&dir.join(META_FILE))? {
                Some(meta) => Some(Entity::Bookmark {
                    meta,
                    link: read_json::<LinkDetail>(&dir.join(LINK_FILE))?,
                }),
                None => None,
            },
        };
        if let Some(found) = &entity {
            if found.id() != id {
                return Err(StorageError::InvalidData(format!(
                    "{} document at {} carries id {}",
                    kind,
                    dir.display(),
                    found.id()
                )));
            }
        }
        Ok(entity)
    }

    /// Writes an entity's documents and clears any deletion marker, which
    /// makes a write after a delete a recreate.
    pub fn write(&self, entity: &Entity) -> StorageResult<()> {
        let dir = self.entity_dir(entity.kind(), entity.id());
        fs::create_dir_all(&dir)?;
        match entity {
            Entity::Folder(folder) => write_json(&dir.join(META_FILE), folder)?,
            Entity::Tag(tag) => write_json(&dir.join(META_FILE), tag)?,
            Entity::Bookmark { meta, link } => {
                write_json(&dir.join(META_FILE), meta)?;
                match link {
                    Some(link) => write_json(&dir.join(LINK_FILE), link)?,
                    None => remove_file_if_exists(&dir.join(LINK_FILE))?,
                }
            }
        }
        remove_file_if_exists(&dir.join(TOMBSTONE_FILE))?;
        debug!(kind = %entity.kind(), id = %entity.id(), "wrote entity");
        Ok(())
    }

    /// Deletes an entity, leaving a marker stamped `at`.
    pub fn delete(
        &self,
        kind: EntityKind,
        id: EntityId,
        at: Timestamp,
    ) -> StorageResult<Tombstone> {
        let tombstone = Tombstone::new(kind, id, at);
        self.write_tombstone(&tombstone)?;
        Ok(tombstone)
    }

    /// Records a deletion: the marker goes down first, then the documents and
    /// auxiliary files are removed. An older marker is replaced; a newer one
    /// is kept.
    pub fn write_tombstone(&self, tombstone: &Tombstone) -> StorageResult<()> {
        let dir = self.entity_dir(tombstone.entity_type, tombstone.entity_id);
        fs::create_dir_all(&dir)?;
        let marker = dir.join(TOMBSTONE_FILE);
        let newer_exists = read_json::<Tombstone>(&marker)?
            .is_some_and(|existing| existing.timestamp > tombstone.timestamp);
        if !newer_exists {
            write_json(&marker, tombstone)?;
        }

        remove_file_if_exists(&dir.join(META_FILE))?;
        remove_file_if_exists(&dir.join(LINK_FILE))?;
        for sub in [READABLE_DIR, ASSETS_DIR, HIGHLIGHTS_DIR] {
            remove_dir_if_exists(&dir.join(sub))?;
        }
        debug!(
            kind = %tombstone.entity_type,
            id = %tombstone.entity_id,
            at = %tombstone.timestamp,
            "wrote tombstone"
        );
        Ok(())
    }

    /// Lists the ids that have a directory under `kind`, live or deleted.
    ///
    /// Each call takes a fresh directory listing; the iterator is lazy.
    /// Entries whose name is not an id are skipped.
    pub fn scan_ids(
        &self,
        kind: EntityKind,
    ) -> StorageResult<impl Iterator<Item = StorageResult<EntityId>> + use<>> {
        let entries = match fs::read_dir(self.root.join(kind.dir_name())) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(entries.into_iter().flatten().filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name();
            let id = EntityId::parse(name.to_str()?).ok()?;
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => Some(Ok(id)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        }))
    }

    /// Whether the entity has a canonical document on disk.
    pub fn has_document(&self, kind: EntityKind, id: EntityId) -> bool {
        self.entity_dir(kind, id).join(META_FILE).is_file()
    }

    /// Whether a deletion marker exists for the entity.
    pub fn is_deleted(&self, kind: EntityKind, id: EntityId) -> bool {
        self.entity_dir(kind, id).join(TOMBSTONE_FILE).is_file()
    }

    /// Live ids of a kind, ascending: a document and no deletion marker.
    pub fn live_ids(&self, kind: EntityKind) -> StorageResult<Vec<EntityId>> {
        let mut ids = Vec::new();
        for id in self.scan_ids(kind)? {
            let id = id?;
            if self.has_document(kind, id) && !self.is_deleted(kind, id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ── Tombstones ───────────────────────────────────────────────

    pub fn tombstone(&self, kind: EntityKind, id: EntityId) -> StorageResult<Option<Tombstone>> {
        read_json(&self.entity_dir(kind, id).join(TOMBSTONE_FILE))
    }

    /// Every deletion marker in the store, oldest first.
    pub fn tombstones(&self) -> StorageResult<Vec<Tombstone>> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            for id in self.scan_ids(kind)? {
                let id = id?;
                match self.tombstone(kind, id) {
                    Ok(Some(t)) => out.push(t),
                    Ok(None) => {}
                    Err(StorageError::Parse { path, source }) => {
                        warn!(
                            path = %path.display(),
                            error = %source,
                            "skipping unreadable tombstone"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        out.sort_by_key(|t| (t.timestamp, t.tombstone_id));
        Ok(out)
    }

    /// Removes deletion markers older than `horizon`. Returns how many went.
    pub fn purge_tombstones_before(&self, horizon: Timestamp) -> StorageResult<usize> {
        let mut purged = 0;
        for tombstone in self.tombstones()? {
            if tombstone.timestamp >= horizon {
                continue;
            }
            let dir = self.entity_dir(tombstone.entity_type, tombstone.entity_id);
            remove_file_if_exists(&dir.join(TOMBSTONE_FILE))?;
            if fs::read_dir(&dir)?.next().is_none() {
                fs::remove_dir(&dir)?;
            }
            purged += 1;
        }
        if purged > 0 {
            debug!(purged, %horizon, "purged tombstones");
        }
        Ok(purged)
    }

    // ── Bookmark auxiliary files ─────────────────────────────────

    pub fn write_readable(
        &self,
        bookmark_id: EntityId,
        version: u32,
        markdown: &str,
    ) -> StorageResult<()> {
        let dir = self
            .entity_dir(EntityKind::Bookmark, bookmark_id)
            .join(READABLE_DIR);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(format!("v{version}.md")), markdown.as_bytes())
    }

    pub fn write_asset(
        &self,
        bookmark_id: EntityId,
        asset_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> StorageResult<()> {
        let dir = self
            .entity_dir(EntityKind::Bookmark, bookmark_id)
            .join(ASSETS_DIR);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(format!("{asset_id}.{extension}")), bytes)
    }

    pub fn write_highlight(&self, highlight: &Highlight) -> StorageResult<()> {
        let dir = self
            .entity_dir(EntityKind::Bookmark, highlight.bookmark_id)
            .join(HIGHLIGHTS_DIR);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(format!("{}.json", highlight.id)), highlight)
    }

    /// Scans a bookmark's auxiliary files. Unrecognised file names are ignored;
    /// an unparseable highlight is a parse error like any other document.
    pub fn aux(&self, bookmark_id: EntityId) -> StorageResult<BookmarkAux> {
        let dir = self.entity_dir(EntityKind::Bookmark, bookmark_id);
        let mut aux = BookmarkAux::default();

        for name in file_names(&dir.join(READABLE_DIR))? {
            let Some(version) = name
                .strip_prefix('v')
                .and_then(|rest| rest.strip_suffix(".md"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            aux.readable_versions.push(ReadableVersion {
                bookmark_id,
                version,
                relative_path: format!("{READABLE_DIR}/{name}"),
            });
        }

        for name in file_names(&dir.join(ASSETS_DIR))? {
            let Some((id, extension)) = name.rsplit_once('.') else {
                continue;
            };
            if id.is_empty() {
                continue;
            }
            aux.assets.push(Asset {
                id: id.to_string(),
                bookmark_id,
                extension: extension.to_string(),
                relative_path: format!("{ASSETS_DIR}/{name}"),
            });
        }

        for name in file_names(&dir.join(HIGHLIGHTS_DIR))? {
            if !name.ends_with(".json") {
                continue;
            }
            let path = dir.join(HIGHLIGHTS_DIR).join(&name);
            if let Some(highlight) = read_json::<Highlight>(&path)? {
                aux.highlights.push(highlight);
            }
        }

        aux.readable_versions.sort_by_key(|r| r.version);
        aux.assets.sort_by(|a, b| a.id.cmp(&b.id));
        aux.highlights.sort_by_key(|h| h.id);
        Ok(aux)
    }
}

// ── Rollback ─────────────────────────────────────────────────────

/// Prior on-disk state of one entity directory.
#[derive(Debug)]
struct EntityFiles {
    dir: PathBuf,
    existed: bool,
    /// `(path relative to dir, contents)` of every file, documents and
    /// auxiliary files alike.
    files: Vec<(PathBuf, Vec<u8>)>,
}

/// Records the files of each entity before it is first written, so a batch
/// that fails part-way can put the store back the way it was.
///
/// Pair it with a database transaction: call [`record`](Self::record) before
/// every write, and [`restore`](Self::restore) if the transaction does not
/// commit.
#[derive(Debug, Default)]
pub struct WriteJournal {
    recorded: Vec<EntityFiles>,
    seen: HashSet<(EntityKind, EntityId)>,
}

impl WriteJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures an entity's files unless they were captured already.
    pub fn record(
        &mut self,
        store: &EntityStore,
        kind: EntityKind,
        id: EntityId,
    ) -> StorageResult<()> {
        if self.seen.contains(&(kind, id)) {
            return Ok(());
        }
        let dir = store.entity_dir(kind, id);
        let existed = match fs::symlink_metadata(&dir) {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        if existed {
            collect_files(&dir, Path::new(""), &mut files)?;
        }
        self.recorded.push(EntityFiles { dir, existed, files });
        self.seen.insert((kind, id));
        Ok(())
    }

    /// Number of entities captured so far.
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Puts every captured entity directory back as it was, newest first.
    /// Keeps going past failures and returns the first one.
    pub fn restore(self) -> StorageResult<()> {
        let mut first_error = None;
        for entity in self.recorded.into_iter().rev() {
            if let Err(e) = restore_dir(&entity) {
                warn!(dir = %entity.dir.display(), error = %e, "could not restore entity files");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn collect_files(root: &Path, rel: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) -> StorageResult<()> {
    for entry in fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let path = rel.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            out.push((path.clone(), fs::read(root.join(&path))?));
        }
    }
    Ok(())
}

fn restore_dir(entity: &EntityFiles) -> StorageResult<()> {
    match fs::symlink_metadata(&entity.dir) {
        Ok(meta) if meta.is_dir() && entity.existed => fs::remove_dir_all(&entity.dir)?,
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(&entity.dir)?;
            return Ok(());
        }
        // Not ours: whatever sits at the path was there before.
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if !entity.existed {
                return Ok(());
            }
        }
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(&entity.dir)?;
    for (rel, bytes) in &entity.files {
        let path = entity.dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, bytes)?;
    }
    Ok(())
}

// ── File helpers ─────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn remove_dir_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn file_names(dir: &Path) -> StorageResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.ends_with(".tmp") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
