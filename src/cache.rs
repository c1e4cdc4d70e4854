use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use memmap::Mmap;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::mime::{get_mime_type_enum, MimeType};

/// Request path served when the request-target is bare `/`.
pub const INDEX_PAGE: &str = "index.html";
/// Error pages that must exist under the asset root; startup fails otherwise.
pub const ERROR_404_PAGE: &str = "error_404.html";
pub const ERROR_500_PAGE: &str = "error_500.html";

const DEFAULT_PAGE_SIZE: u64 = 4096;

static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as u64
    } else {
        DEFAULT_PAGE_SIZE
    }
});

/// Backing storage for one cached asset. Small files are mapped read-only at
/// startup; larger files keep their descriptor open for positional reads.
pub enum Body {
    Mapped(Mmap),
    Fd(File),
}

/// One cached file, immutable for the process lifetime.
pub struct AssetEntry {
    path_key: String,
    mime: MimeType,
    size: u64,
    body: Body,
}

impl AssetEntry {
    /// Canonical relative path as it appears in a request after the leading
    /// slash is stripped.
    pub fn path_key(&self) -> &str {
        &self.path_key
    }

    pub fn mime_type(&self) -> MimeType {
        self.mime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.body, Body::Mapped(_))
    }
}

/// Immutable snapshot of the asset root, built once at startup and read
/// concurrently by all workers without synchronization.
pub struct AssetCache {
    entries: Vec<AssetEntry>,
    index: FxHashMap<String, usize>,
    not_found: usize,
    server_error: usize,
}

impl AssetCache {
    /// Walk `root` and load every regular file. The walk runs twice: a
    /// counting pass sizes the entry vector, a second pass populates it.
    /// Missing error pages or an unreadable/empty root are fatal.
    pub fn build(root: &Path) -> Result<Self, CacheError> {
        let mut count = 0usize;
        walk(root, String::new(), &mut |_, _, _| count += 1).map_err(|source| {
            CacheError::Walk {
                path: root.to_path_buf(),
                source,
            }
        })?;

        if count == 0 {
            return Err(CacheError::Empty(root.to_path_buf()));
        }

        let mut entries = Vec::with_capacity(count);
        walk(root, String::new(), &mut |full, rel, size| {
            if let Some(entry) = load_entry(&full, rel, size) {
                entries.push(entry);
            }
        })
        .map_err(|source| CacheError::Walk {
            path: root.to_path_buf(),
            source,
        })?;

        let mut index = FxHashMap::default();
        for (pos, entry) in entries.iter().enumerate() {
            index.insert(entry.path_key.clone(), pos);
        }

        let not_found = *index
            .get(ERROR_404_PAGE)
            .ok_or(CacheError::MissingErrorPage(ERROR_404_PAGE))?;
        let server_error = *index
            .get(ERROR_500_PAGE)
            .ok_or(CacheError::MissingErrorPage(ERROR_500_PAGE))?;

        Ok(Self {
            entries,
            index,
            not_found,
            server_error,
        })
    }

    /// Exact-match lookup on the relative path. The empty key aliases the
    /// index page.
    pub fn lookup(&self, key: &str) -> Option<&AssetEntry> {
        if key.is_empty() {
            return self.lookup(INDEX_PAGE);
        }
        self.index.get(key).map(|&pos| &self.entries[pos])
    }

    pub fn not_found(&self) -> &AssetEntry {
        &self.entries[self.not_found]
    }

    pub fn server_error(&self) -> &AssetEntry {
        &self.entries[self.server_error]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AssetEntry> {
        self.entries.iter()
    }
}

/// Recursive walk over the asset tree. Regular files are reported to `visit`
/// with their full path, relative key, and size. Unreadable entries are
/// logged and skipped; only a failure on the directory itself propagates.
fn walk(
    dir: &Path,
    rel: String,
    visit: &mut dyn FnMut(PathBuf, String, u64),
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "skipping unreadable directory entry");
                continue;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let child_rel = if rel.is_empty() {
            name.to_string()
        } else {
            format!("{rel}/{name}")
        };

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "stat failed, skipping");
                continue;
            }
        };

        if meta.is_dir() {
            if let Err(err) = walk(&entry.path(), child_rel, visit) {
                warn!(dir = %entry.path().display(), %err, "failed to read directory, skipping subtree");
            }
        } else if meta.is_file() {
            visit(entry.path(), child_rel, meta.len());
        }
    }
    Ok(())
}

/// Open one file and decide its body representation: files no larger than a
/// page are mapped (and the descriptor closed); everything else keeps the
/// descriptor for positional reads. A failed map falls back to the
/// descriptor; a failed open drops the entry.
fn load_entry(full: &Path, rel: String, size: u64) -> Option<AssetEntry> {
    let file = match File::open(full) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %full.display(), %err, "failed to open asset, skipping");
            return None;
        }
    };

    let mime = get_mime_type_enum(full);
    let body = if size > 0 && size <= *PAGE_SIZE {
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                debug!(path = %full.display(), size, "mapped asset");
                Body::Mapped(map)
            }
            Err(err) => {
                warn!(path = %full.display(), %err, "mmap failed, keeping descriptor");
                Body::Fd(file)
            }
        }
    } else {
        Body::Fd(file)
    };

    debug!(path = %full.display(), key = %rel, mime = mime.as_str(), "adding asset to cache");
    Some(AssetEntry {
        path_key: rel,
        mime,
        size,
        body,
    })
}
