//! Core value types shared by the cluster core and the subvolume vtable.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::time::SystemTime;

/// 128-bit opaque file identifier. Stable across renames and data
/// migration; a file keeps its gfid no matter which subvolume holds it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Gfid(pub [u8; 16]);

impl Gfid {
    /// The all-zero gfid, used as "not yet known".
    pub const NULL: Gfid = Gfid([0; 16]);

    /// The well-known root gfid (`00...01`).
    pub const ROOT: Gfid = {
        let mut raw = [0u8; 16];
        raw[15] = 1;
        Gfid(raw)
    };

    pub fn is_null(&self) -> bool {
        *self == Gfid::NULL
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfid({self})")
    }
}

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

/// Sticky bit in the permission word (`S_ISVTX`).
pub const MODE_STICKY: u16 = 0o1000;
/// Set-group-id bit in the permission word (`S_ISGID`).
pub const MODE_SGID: u16 = 0o2000;

/// The permission word of a pointer file: sticky bit only, nothing else.
/// A zero-length regular file with exactly this mode is a link file (when
/// it also carries the linkto xattr) or a migration phase-2 stub.
pub const LINKFILE_MODE: u16 = MODE_STICKY;

/// File attributes as reported by a subvolume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileAttr {
    /// File identifier, stable across renames and migration
    pub gfid: Gfid,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permission bits, including setuid/setgid/sticky
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev for device nodes
    pub rdev: u32,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte sectors. May be smaller than the file
    /// size for sparse files.
    pub blocks: u64,
    /// Preferred I/O block size
    pub blksize: u32,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last status change
    pub ctime: SystemTime,
}

impl FileAttr {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileType::RegularFile
    }

    pub fn is_sticky(&self) -> bool {
        self.perm & MODE_STICKY != 0
    }

    pub fn is_sgid(&self) -> bool {
        self.perm & MODE_SGID != 0
    }

    /// Mode check half of the link-file test: a regular file whose
    /// permission word is exactly the sticky bit. The caller must also
    /// verify the linkto xattr is present before trusting the file as a
    /// pointer; see [`crate::linkfile::is_linkfile`].
    pub fn has_linkfile_mode(&self) -> bool {
        self.is_regular() && self.perm == LINKFILE_MODE
    }
}

impl Default for FileAttr {
    fn default() -> Self {
        FileAttr {
            gfid: Gfid::NULL,
            kind: FileType::RegularFile,
            perm: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }
}

/// The rebalance state a file's mode bits advertise to every client.
///
/// During migration the mover flips well-known permission bits on the
/// source file; they are the only coordination channel between clients and
/// the rebalance process. No other code should interpret these bits
/// directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Data copy in progress: sticky and sgid both set on a regular file.
    /// The source still serves reads and takes writes.
    InProgress,
    /// Copy finished, source is a stub with link-file mode. Readers must
    /// follow the linkto xattr to the destination.
    Complete,
}

impl MigrationPhase {
    /// Classify an attribute word. `None` means no migration is signalled.
    pub fn from_attr(attr: &FileAttr) -> Option<MigrationPhase> {
        if !attr.is_regular() {
            return None;
        }
        if attr.perm == LINKFILE_MODE {
            Some(MigrationPhase::Complete)
        } else if attr.is_sticky() && attr.is_sgid() {
            Some(MigrationPhase::InProgress)
        } else {
            None
        }
    }
}

/// Remove the phase-1 marker bits before handing attributes back to the
/// caller, so higher layers never observe the in-progress encoding.
pub fn strip_phase1_flags(attr: &mut FileAttr) {
    if MigrationPhase::from_attr(attr) == Some(MigrationPhase::InProgress) {
        attr.perm &= !(MODE_STICKY | MODE_SGID);
    }
}

/// Location of an operation's target: path plus whatever identity is
/// already resolved.
#[derive(Clone, Debug, Default)]
pub struct Loc {
    /// Full path from the cluster root, `/`-separated
    pub path: String,
    /// Final path component; empty for the root and for bare-gfid lookups
    pub name: String,
    /// Target gfid, `NULL` until a lookup resolved it
    pub gfid: Gfid,
    /// Parent directory gfid, `NULL` for the root and for bare-gfid lookups
    pub parent: Gfid,
}

impl Loc {
    /// The cluster root.
    pub fn root() -> Loc {
        Loc {
            path: "/".to_owned(),
            name: String::new(),
            gfid: Gfid::ROOT,
            parent: Gfid::NULL,
        }
    }

    /// A named child of `parent`.
    pub fn child(parent: &Loc, name: &str) -> Loc {
        let path = if parent.path.ends_with('/') {
            format!("{}{}", parent.path, name)
        } else {
            format!("{}/{}", parent.path, name)
        };
        Loc {
            path,
            name: name.to_owned(),
            gfid: Gfid::NULL,
            parent: parent.gfid,
        }
    }

    /// A bare-gfid location, as produced by NFS-style handle resolution.
    /// Carries no parent and no name; the cluster must discover the file
    /// by asking every subvolume.
    pub fn from_gfid(gfid: Gfid) -> Loc {
        Loc {
            path: format!("<gfid:{gfid}>"),
            name: String::new(),
            gfid,
            parent: Gfid::NULL,
        }
    }

    /// True when only the gfid is known (no parent linkage).
    pub fn is_discover(&self) -> bool {
        self.parent.is_null() && self.name.is_empty() && !self.gfid.is_null() && self.gfid != Gfid::ROOT
    }
}

/// Filesystem statistics from one subvolume, `statvfs(3)` shaped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statvfs {
    /// Preferred I/O block size
    pub bsize: u64,
    /// Fundamental block size (unit of the block counts)
    pub frsize: u64,
    /// Total blocks in units of `frsize`
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Maximum filename length
    pub namemax: u64,
}

/// One entry of a directory listing.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Kind of file
    pub kind: FileType,
    /// Opaque resume offset within the producing subvolume
    pub offset: u64,
    /// Attributes, present for readdirp-style listings
    pub attr: Option<FileAttr>,
    /// Extended attributes requested alongside the listing
    pub xattrs: Xattrs,
}

/// An extended-attribute dictionary.
///
/// Keys are UTF-8 names, values are raw bytes. Inserts always copy the
/// value; replies from different subvolumes never share buffers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Xattrs(BTreeMap<String, Vec<u8>>);

impl Xattrs {
    pub fn new() -> Xattrs {
        Xattrs::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Value as UTF-8, trimming a trailing NUL if the writer added one.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let raw = self.0.get(key)?;
        let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        std::str::from_utf8(raw).ok()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: &str) {
        self.0.insert(key.into(), value.as_bytes().to_vec());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<u8>> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Xattrs {
    type Item = (&'a String, &'a Vec<u8>);
    type IntoIter = btree_map::Iter<'a, String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<u8>)> for Xattrs {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Xattrs {
        Xattrs(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn attr(kind: FileType, perm: u16) -> FileAttr {
        FileAttr {
            kind,
            perm,
            ..FileAttr::default()
        }
    }

    #[test]
    fn migration_phase_from_mode_bits() {
        let phase1 = attr(FileType::RegularFile, 0o644 | MODE_STICKY | MODE_SGID);
        assert_eq!(
            MigrationPhase::from_attr(&phase1),
            Some(MigrationPhase::InProgress)
        );

        let phase2 = attr(FileType::RegularFile, LINKFILE_MODE);
        assert_eq!(
            MigrationPhase::from_attr(&phase2),
            Some(MigrationPhase::Complete)
        );

        // A directory can legitimately carry sticky+sgid (e.g. /tmp-style
        // shared dirs); never read those as migration state.
        let dir = attr(FileType::Directory, 0o777 | MODE_STICKY | MODE_SGID);
        assert_eq!(MigrationPhase::from_attr(&dir), None);

        let plain = attr(FileType::RegularFile, 0o644);
        assert_eq!(MigrationPhase::from_attr(&plain), None);
    }

    #[test]
    fn strip_phase1_removes_only_marker_bits() {
        let mut buf = attr(FileType::RegularFile, 0o640 | MODE_STICKY | MODE_SGID);
        strip_phase1_flags(&mut buf);
        assert_eq!(buf.perm, 0o640);

        // Phase-2 stubs keep their mode; the lookup path handles them.
        let mut stub = attr(FileType::RegularFile, LINKFILE_MODE);
        strip_phase1_flags(&mut stub);
        assert_eq!(stub.perm, LINKFILE_MODE);
    }

    #[test]
    fn xattr_get_str_trims_nul() {
        let mut x = Xattrs::new();
        x.set("k", b"brick-3\0".to_vec());
        assert_eq!(x.get_str("k"), Some("brick-3"));
    }

    #[test]
    fn loc_child_builds_path() {
        let root = Loc::root();
        let a = Loc::child(&root, "a");
        assert_eq!(a.path, "/a");
        let mut a = a;
        a.gfid = Gfid([7; 16]);
        let b = Loc::child(&a, "b");
        assert_eq!(b.path, "/a/b");
        assert_eq!(b.parent, Gfid([7; 16]));
    }
}
