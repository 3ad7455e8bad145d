//! File registry: the directory's record of who shares what.
//!
//! Not persisted. Entries live exactly as long as the socket that
//! registered them.

use std::collections::BTreeMap;

use ferry_core::message::{FileOffer, LISTING_HEADING, NO_FILES_MESSAGE};
use ferry_core::{FileId, SocketId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    /// Socket the owner registered the file over.
    pub owner: SocketId,
    /// Where other peers reach the owner.
    pub host: String,
    pub port: u16,
    /// Owner-local path, handed back only to the owner.
    pub path: String,
}

pub struct FileRegistry {
    files: BTreeMap<FileId, FileRecord>,
    next_id: FileId,
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one offered file and return its fresh id.
    pub fn register(&mut self, owner: SocketId, host: &str, port: u16, offer: FileOffer) -> FileId {
        let file_id = self.next_id;
        self.next_id += 1;
        self.files.insert(
            file_id,
            FileRecord {
                file_id,
                name: offer.name,
                size: offer.size,
                owner,
                host: host.to_string(),
                port,
                path: offer.path,
            },
        );
        file_id
    }

    pub fn get(&self, file_id: FileId) -> Option<&FileRecord> {
        self.files.get(&file_id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// Drop every file whose owner is no longer connected. Returns the
    /// removed records.
    pub fn retain_owners(&mut self, is_live: impl Fn(SocketId) -> bool) -> Vec<FileRecord> {
        let dead: Vec<FileId> = self
            .files
            .values()
            .filter(|r| !is_live(r.owner))
            .map(|r| r.file_id)
            .collect();
        dead.iter().filter_map(|id| self.files.remove(id)).collect()
    }

    /// Body of the `list` response.
    pub fn render_listing(&self) -> String {
        if self.files.is_empty() {
            return NO_FILES_MESSAGE.to_string();
        }
        let mut out = String::from(LISTING_HEADING);
        for record in self.files.values() {
            out.push_str(&format!(
                "\t{}) {} - ({} B)\r\n",
                record.file_id, record.name, record.size
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(name: &str, size: u64) -> FileOffer {
        FileOffer {
            name: name.into(),
            size,
            path: format!("/share/{name}"),
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut registry = FileRegistry::new();
        assert_eq!(registry.register(3, "10.0.0.2", 27891, offer("a", 1)), 1);
        assert_eq!(registry.register(3, "10.0.0.2", 27891, offer("b", 2)), 2);
        assert_eq!(registry.get(2).unwrap().name, "b");
    }

    #[test]
    fn empty_listing_uses_sentinel() {
        let registry = FileRegistry::new();
        assert_eq!(
            registry.render_listing(),
            "\r\nThere are currently no files stored on the server.\r\n"
        );
    }

    #[test]
    fn listing_has_one_line_per_file() {
        let mut registry = FileRegistry::new();
        registry.register(3, "h", 1, offer("report.pdf", 5000));
        registry.register(4, "h", 2, offer("notes.txt", 12));
        assert_eq!(
            registry.render_listing(),
            "\r\nFile Listing:\r\n\t1) report.pdf - (5000 B)\r\n\t2) notes.txt - (12 B)\r\n"
        );
    }

    #[test]
    fn pruning_removes_only_dead_owners() {
        let mut registry = FileRegistry::new();
        registry.register(3, "h", 1, offer("keep", 1));
        registry.register(4, "h", 2, offer("gone", 1));
        registry.register(4, "h", 2, offer("gone too", 1));

        let removed = registry.retain_owners(|owner| owner == 3);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());

        // Ids are not reused after pruning.
        assert_eq!(registry.register(5, "h", 3, offer("new", 1)), 4);
    }
}
