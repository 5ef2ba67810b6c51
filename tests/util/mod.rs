//! In-memory brick and cluster fixtures for the integration tests.
//!
//! `MemBrick` implements enough of the `Subvolume` contract to stand in
//! for a posix brick: a gfid-indexed node table, a name table per
//! directory, open-fd tracking, xattrs, and honest reply attributes
//! (including the migration marker bits the cluster watches for).

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use scatterfs::{
    AccessMode, AttrPair, ChildEvent, CreateReply, DirEntry, Distribute, EntryReply, Errno, Fd,
    FileAttr, FileType, FopResult, GFID_REQ_KEY, Gfid, INTERNAL_FOP_KEY, LockCmd, LockKind, Loc,
    LookupReply, OPEN_FD_COUNT_KEY, OpenFlags, Options, PosixLock, ReadReply, RenameReply,
    SetAttrs, Statvfs, SubvolRef, Subvolume, UnlinkReply, WriteReply, XattropOp, Xattrs,
};

#[derive(Clone)]
struct Node {
    attr: FileAttr,
    xattrs: Xattrs,
    data: Vec<u8>,
    symlink_target: Option<String>,
}

impl Node {
    fn new(gfid: Gfid, kind: FileType, perm: u16) -> Node {
        let now = SystemTime::now();
        Node {
            attr: FileAttr {
                gfid,
                kind,
                perm,
                nlink: 1,
                blksize: 4096,
                atime: now,
                mtime: now,
                ctime: now,
                ..FileAttr::default()
            },
            xattrs: Xattrs::new(),
            data: Vec::new(),
            symlink_target: None,
        }
    }

    fn refresh_size(&mut self) {
        self.attr.size = self.data.len() as u64;
        self.attr.blocks = (self.data.len() as u64).div_ceil(512);
        self.attr.mtime = SystemTime::now();
    }
}

struct BrickState {
    nodes: HashMap<Gfid, Node>,
    /// directory gfid -> name -> child gfid
    entries: HashMap<Gfid, BTreeMap<String, Gfid>>,
    fds: HashMap<u64, Gfid>,
    next_fd: u64,
    next_gfid: u64,
    statfs: Statvfs,
    locks: HashSet<(String, Gfid)>,
}

pub struct MemBrick {
    name: String,
    state: Mutex<BrickState>,
}

impl MemBrick {
    pub fn new(name: &str) -> Arc<MemBrick> {
        let mut nodes = HashMap::new();
        let mut entries = HashMap::new();
        nodes.insert(Gfid::ROOT, Node::new(Gfid::ROOT, FileType::Directory, 0o755));
        entries.insert(Gfid::ROOT, BTreeMap::new());
        Arc::new(MemBrick {
            name: name.to_owned(),
            state: Mutex::new(BrickState {
                nodes,
                entries,
                fds: HashMap::new(),
                next_fd: 1,
                next_gfid: 1,
                statfs: Statvfs {
                    bsize: 4096,
                    frsize: 4096,
                    blocks: 1 << 20,
                    bfree: 1 << 19,
                    bavail: 1 << 19,
                    files: 1 << 20,
                    ffree: 1 << 19,
                    namemax: 255,
                },
                locks: HashSet::new(),
            }),
        })
    }

    /// Set free space to roughly `percent` of capacity.
    pub fn set_free_percent(&self, percent: u64) {
        let mut state = self.state.lock().unwrap();
        let blocks = state.statfs.blocks;
        state.statfs.bavail = blocks * percent / 100;
        state.statfs.bfree = state.statfs.bavail;
    }

    fn fresh_gfid(name: &str, state: &mut BrickState) -> Gfid {
        let mut raw = [0u8; 16];
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in name.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x1000_0000_01b3);
        }
        raw[..8].copy_from_slice(&h.to_be_bytes());
        raw[8..].copy_from_slice(&state.next_gfid.to_be_bytes());
        state.next_gfid += 1;
        Gfid(raw)
    }
}

fn path_components(path: &str) -> Vec<&str> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .collect()
}

impl BrickState {
    fn resolve(&self, loc: &Loc) -> Option<Gfid> {
        if !loc.gfid.is_null() && self.nodes.contains_key(&loc.gfid) {
            return Some(loc.gfid);
        }
        if !loc.parent.is_null() && !loc.name.is_empty() {
            return self.entries.get(&loc.parent)?.get(&loc.name).copied();
        }
        self.resolve_path(&loc.path)
    }

    fn resolve_path(&self, path: &str) -> Option<Gfid> {
        let mut at = Gfid::ROOT;
        for component in path_components(path) {
            at = *self.entries.get(&at)?.get(component)?;
        }
        Some(at)
    }

    fn parent_of(&self, loc: &Loc) -> Option<Gfid> {
        if !loc.parent.is_null() {
            return Some(loc.parent);
        }
        let components = path_components(&loc.path);
        if components.len() <= 1 {
            return Some(Gfid::ROOT);
        }
        let mut at = Gfid::ROOT;
        for component in &components[..components.len() - 1] {
            at = *self.entries.get(&at)?.get(*component)?;
        }
        Some(at)
    }

    fn name_of(&self, loc: &Loc) -> String {
        if !loc.name.is_empty() {
            return loc.name.clone();
        }
        path_components(&loc.path)
            .last()
            .copied()
            .unwrap_or_default()
            .to_owned()
    }

    fn open_fd_count(&self, gfid: Gfid) -> u64 {
        self.fds.values().filter(|g| **g == gfid).count() as u64
    }

    fn requested_xattrs(&self, node: &Node, gfid: Gfid, req: &Xattrs) -> Xattrs {
        let mut out = Xattrs::new();
        for key in req.keys() {
            if key == OPEN_FD_COUNT_KEY {
                out.set(key, self.open_fd_count(gfid).to_be_bytes().to_vec());
            } else if let Some(value) = node.xattrs.get(key) {
                out.set(key, value.to_vec());
            }
        }
        out
    }

    fn insert_node(
        &mut self,
        parent: Gfid,
        name: &str,
        kind: FileType,
        perm: u16,
        xattrs: &Xattrs,
    ) -> Result<Gfid, Errno> {
        if !self.nodes.contains_key(&parent) {
            return Err(Errno::ENOENT);
        }
        if self
            .entries
            .get(&parent)
            .is_some_and(|dir| dir.contains_key(name))
        {
            return Err(Errno::EEXIST);
        }

        let gfid = match xattrs.get(GFID_REQ_KEY) {
            Some(raw) if raw.len() == 16 => Gfid(raw.try_into().unwrap()),
            _ => MemBrick::fresh_gfid(name, self),
        };

        let mut node = Node::new(gfid, kind, perm);
        for (key, value) in xattrs {
            if key == GFID_REQ_KEY || key == INTERNAL_FOP_KEY {
                continue;
            }
            node.xattrs.set(key.clone(), value.clone());
        }

        self.nodes.insert(gfid, node);
        if kind == FileType::Directory {
            self.entries.insert(gfid, BTreeMap::new());
        }
        self.entries.entry(parent).or_default().insert(name.to_owned(), gfid);
        Ok(gfid)
    }

    fn entry_reply(&self, gfid: Gfid, parent: Gfid) -> EntryReply {
        let attr = self.nodes[&gfid].attr;
        let parent_attr = self
            .nodes
            .get(&parent)
            .map(|n| n.attr)
            .unwrap_or_default();
        EntryReply {
            attr,
            preparent: parent_attr,
            postparent: parent_attr,
        }
    }
}

#[async_trait]
impl Subvolume for MemBrick {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, loc: &Loc, xattr_req: &Xattrs) -> FopResult<LookupReply> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?;
        let postparent = state
            .parent_of(loc)
            .and_then(|p| state.nodes.get(&p))
            .map(|n| n.attr);
        Ok(LookupReply {
            attr: node.attr,
            xattrs: state.requested_xattrs(node, gfid, xattr_req),
            postparent,
        })
    }

    async fn stat(&self, loc: &Loc) -> FopResult<FileAttr> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        Ok(state.nodes[&gfid].attr)
    }

    async fn fstat(&self, fd: Fd) -> FopResult<FileAttr> {
        let state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?;
        Ok(node.attr)
    }

    async fn truncate(&self, loc: &Loc, size: u64) -> FopResult<AttrPair> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let pre = node.attr;
        node.data.resize(size as usize, 0);
        node.refresh_size();
        Ok(AttrPair {
            pre,
            post: node.attr,
        })
    }

    async fn ftruncate(&self, fd: Fd, size: u64) -> FopResult<AttrPair> {
        let mut state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let pre = node.attr;
        node.data.resize(size as usize, 0);
        node.refresh_size();
        Ok(AttrPair {
            pre,
            post: node.attr,
        })
    }

    async fn access(&self, loc: &Loc, _mask: u32) -> FopResult<()> {
        let state = self.state.lock().unwrap();
        state.resolve(loc).ok_or(Errno::ENOENT)?;
        Ok(())
    }

    async fn readlink(&self, loc: &Loc) -> FopResult<String> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        state.nodes[&gfid]
            .symlink_target
            .clone()
            .ok_or(Errno::EINVAL)
    }

    async fn mknod(
        &self,
        loc: &Loc,
        kind: FileType,
        perm: u16,
        rdev: u32,
        xattrs: &Xattrs,
    ) -> FopResult<EntryReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);
        let gfid = state.insert_node(parent, &name, kind, perm, xattrs)?;
        state.nodes.get_mut(&gfid).unwrap().attr.rdev = rdev;
        Ok(state.entry_reply(gfid, parent))
    }

    async fn mkdir(&self, loc: &Loc, perm: u16, xattrs: &Xattrs) -> FopResult<EntryReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);
        let gfid = state.insert_node(parent, &name, FileType::Directory, perm, xattrs)?;
        Ok(state.entry_reply(gfid, parent))
    }

    async fn unlink(&self, loc: &Loc, _xattrs: &Xattrs) -> FopResult<UnlinkReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);
        let preparent = state.nodes.get(&parent).map(|n| n.attr).unwrap_or_default();

        let gfid = state
            .entries
            .get_mut(&parent)
            .and_then(|dir| dir.remove(&name))
            .ok_or(Errno::ENOENT)?;

        let dropped = match state.nodes.get_mut(&gfid) {
            Some(node) => {
                node.attr.nlink = node.attr.nlink.saturating_sub(1);
                node.attr.nlink == 0
            }
            None => false,
        };
        if dropped {
            state.nodes.remove(&gfid);
        }

        let postparent = state.nodes.get(&parent).map(|n| n.attr).unwrap_or_default();
        Ok(UnlinkReply {
            preparent,
            postparent,
        })
    }

    async fn rmdir(&self, loc: &Loc) -> FopResult<UnlinkReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);
        let gfid = *state
            .entries
            .get(&parent)
            .and_then(|dir| dir.get(&name))
            .ok_or(Errno::ENOENT)?;

        if state.entries.get(&gfid).is_some_and(|dir| !dir.is_empty()) {
            return Err(Errno::ENOTEMPTY);
        }

        let preparent = state.nodes.get(&parent).map(|n| n.attr).unwrap_or_default();
        state.entries.get_mut(&parent).unwrap().remove(&name);
        state.entries.remove(&gfid);
        state.nodes.remove(&gfid);
        let postparent = state.nodes.get(&parent).map(|n| n.attr).unwrap_or_default();
        Ok(UnlinkReply {
            preparent,
            postparent,
        })
    }

    async fn symlink(&self, loc: &Loc, target: &str, xattrs: &Xattrs) -> FopResult<EntryReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);
        let gfid = state.insert_node(parent, &name, FileType::Symlink, 0o777, xattrs)?;
        state.nodes.get_mut(&gfid).unwrap().symlink_target = Some(target.to_owned());
        Ok(state.entry_reply(gfid, parent))
    }

    async fn rename(&self, src: &Loc, dst: &Loc) -> FopResult<RenameReply> {
        let mut state = self.state.lock().unwrap();
        let src_parent = state.parent_of(src).ok_or(Errno::ENOENT)?;
        let src_name = state.name_of(src);
        let dst_parent = state.parent_of(dst).ok_or(Errno::ENOENT)?;
        let dst_name = state.name_of(dst);

        let gfid = state
            .entries
            .get_mut(&src_parent)
            .and_then(|dir| dir.remove(&src_name))
            .ok_or(Errno::ENOENT)?;

        if let Some(displaced) = state
            .entries
            .get_mut(&dst_parent)
            .and_then(|dir| dir.insert(dst_name, gfid))
        {
            if displaced != gfid {
                let dropped = match state.nodes.get_mut(&displaced) {
                    Some(node) => {
                        node.attr.nlink = node.attr.nlink.saturating_sub(1);
                        node.attr.nlink == 0
                    }
                    None => false,
                };
                if dropped {
                    state.nodes.remove(&displaced);
                }
            }
        }

        Ok(RenameReply {
            attr: state.nodes[&gfid].attr,
        })
    }

    async fn link(&self, src: &Loc, dst: &Loc) -> FopResult<EntryReply> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(src).ok_or(Errno::ENOENT)?;
        let dst_parent = state.parent_of(dst).ok_or(Errno::ENOENT)?;
        let dst_name = state.name_of(dst);

        if state
            .entries
            .get(&dst_parent)
            .is_some_and(|dir| dir.contains_key(&dst_name))
        {
            return Err(Errno::EEXIST);
        }
        state
            .entries
            .get_mut(&dst_parent)
            .ok_or(Errno::ENOENT)?
            .insert(dst_name, gfid);
        state.nodes.get_mut(&gfid).unwrap().attr.nlink += 1;
        Ok(state.entry_reply(gfid, dst_parent))
    }

    async fn open(&self, loc: &Loc, _acc: AccessMode, flags: OpenFlags) -> FopResult<Fd> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        if flags.contains(OpenFlags::TRUNC) {
            if let Some(node) = state.nodes.get_mut(&gfid) {
                node.data.clear();
                node.refresh_size();
            }
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, gfid);
        Ok(Fd(fd))
    }

    async fn create(
        &self,
        loc: &Loc,
        _acc: AccessMode,
        flags: OpenFlags,
        perm: u16,
        xattrs: &Xattrs,
    ) -> FopResult<CreateReply> {
        let mut state = self.state.lock().unwrap();
        let parent = state.parent_of(loc).ok_or(Errno::ENOENT)?;
        let name = state.name_of(loc);

        let gfid = match state
            .entries
            .get(&parent)
            .and_then(|dir| dir.get(&name))
            .copied()
        {
            Some(existing) => {
                if flags.contains(OpenFlags::TRUNC) {
                    if let Some(node) = state.nodes.get_mut(&existing) {
                        node.data.clear();
                        node.refresh_size();
                    }
                }
                existing
            }
            None => state.insert_node(parent, &name, FileType::RegularFile, perm, xattrs)?,
        };

        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, gfid);
        let entry = state.entry_reply(gfid, parent);
        Ok(CreateReply { fd: Fd(fd), entry })
    }

    async fn readv(&self, fd: Fd, size: usize, offset: u64) -> FopResult<ReadReply> {
        let state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?;
        let start = (offset as usize).min(node.data.len());
        let end = (start + size).min(node.data.len());
        Ok(ReadReply {
            data: node.data[start..end].to_vec(),
            postbuf: node.attr,
        })
    }

    async fn writev(&self, fd: Fd, data: &[u8], offset: u64) -> FopResult<WriteReply> {
        let mut state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let prebuf = node.attr;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.refresh_size();
        Ok(WriteReply {
            written: data.len(),
            prebuf,
            postbuf: node.attr,
        })
    }

    async fn flush(&self, fd: Fd) -> FopResult<()> {
        let state = self.state.lock().unwrap();
        state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        Ok(())
    }

    async fn fsync(&self, fd: Fd, _datasync: bool) -> FopResult<AttrPair> {
        let state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let attr = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?.attr;
        Ok(AttrPair {
            pre: attr,
            post: attr,
        })
    }

    async fn opendir(&self, loc: &Loc) -> FopResult<Fd> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        if !state.entries.contains_key(&gfid) {
            return Err(Errno::ENOTDIR);
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, gfid);
        Ok(Fd(fd))
    }

    async fn readdir(&self, fd: Fd, offset: u64, count: usize) -> FopResult<Vec<DirEntry>> {
        self.list_dir(fd, offset, count, None).await
    }

    async fn readdirp(
        &self,
        fd: Fd,
        offset: u64,
        count: usize,
        xattr_req: &Xattrs,
    ) -> FopResult<Vec<DirEntry>> {
        self.list_dir(fd, offset, count, Some(xattr_req)).await
    }

    async fn fsyncdir(&self, fd: Fd, _datasync: bool) -> FopResult<()> {
        let state = self.state.lock().unwrap();
        state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        Ok(())
    }

    async fn statfs(&self, _loc: &Loc) -> FopResult<Statvfs> {
        Ok(self.state.lock().unwrap().statfs)
    }

    async fn setxattr(&self, loc: &Loc, xattrs: &Xattrs, _flags: i32) -> FopResult<()> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        for (key, value) in xattrs {
            node.xattrs.set(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn getxattr(&self, loc: &Loc, name: Option<&str>) -> FopResult<Xattrs> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?;
        match name {
            None => Ok(node.xattrs.clone()),
            Some(name) => {
                let value = node.xattrs.get(name).ok_or(Errno::ENODATA)?;
                let mut out = Xattrs::new();
                out.set(name, value.to_vec());
                Ok(out)
            }
        }
    }

    async fn fsetxattr(&self, fd: Fd, xattrs: &Xattrs, _flags: i32) -> FopResult<()> {
        let mut state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        for (key, value) in xattrs {
            node.xattrs.set(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn fgetxattr(&self, fd: Fd, name: Option<&str>) -> FopResult<Xattrs> {
        let state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get(&gfid).ok_or(Errno::ENOENT)?;
        match name {
            None => Ok(node.xattrs.clone()),
            Some(name) => {
                let value = node.xattrs.get(name).ok_or(Errno::ENODATA)?;
                let mut out = Xattrs::new();
                out.set(name, value.to_vec());
                Ok(out)
            }
        }
    }

    async fn removexattr(&self, loc: &Loc, name: &str) -> FopResult<()> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        node.xattrs.remove(name).map(|_| ()).ok_or(Errno::ENODATA)
    }

    async fn fremovexattr(&self, fd: Fd, name: &str) -> FopResult<()> {
        let mut state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        node.xattrs.remove(name).map(|_| ()).ok_or(Errno::ENODATA)
    }

    async fn xattrop(&self, loc: &Loc, _op: XattropOp, xattrs: &Xattrs) -> FopResult<Xattrs> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let mut out = Xattrs::new();
        for (key, value) in xattrs {
            let have = node
                .xattrs
                .get(key)
                .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            let add = <[u8; 8]>::try_from(value.as_slice())
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            let sum = have.wrapping_add(add);
            node.xattrs.set(key.clone(), sum.to_be_bytes().to_vec());
            out.set(key.clone(), sum.to_be_bytes().to_vec());
        }
        Ok(out)
    }

    async fn inodelk(
        &self,
        domain: &str,
        loc: &Loc,
        cmd: LockCmd,
        _kind: LockKind,
    ) -> FopResult<()> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let key = (domain.to_owned(), gfid);
        match cmd {
            LockCmd::Lock | LockCmd::TryLock => {
                if state.locks.contains(&key) {
                    return Err(Errno::EAGAIN);
                }
                state.locks.insert(key);
                Ok(())
            }
            LockCmd::Unlock => {
                state.locks.remove(&key);
                Ok(())
            }
        }
    }

    async fn lk(&self, fd: Fd, _cmd: LockCmd, lock: &PosixLock) -> FopResult<PosixLock> {
        let state = self.state.lock().unwrap();
        state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        Ok(*lock)
    }

    async fn setattr(&self, loc: &Loc, attrs: &SetAttrs) -> FopResult<AttrPair> {
        let mut state = self.state.lock().unwrap();
        let gfid = state.resolve(loc).ok_or(Errno::ENOENT)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let pre = node.attr;
        apply_setattr(&mut node.attr, attrs);
        Ok(AttrPair {
            pre,
            post: node.attr,
        })
    }

    async fn fsetattr(&self, fd: Fd, attrs: &SetAttrs) -> FopResult<AttrPair> {
        let mut state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let node = state.nodes.get_mut(&gfid).ok_or(Errno::ENOENT)?;
        let pre = node.attr;
        apply_setattr(&mut node.attr, attrs);
        Ok(AttrPair {
            pre,
            post: node.attr,
        })
    }

    async fn forget(&self, _gfid: Gfid) {}

    async fn release(&self, fd: Fd) -> FopResult<()> {
        self.state.lock().unwrap().fds.remove(&fd.0);
        Ok(())
    }

    async fn releasedir(&self, fd: Fd) -> FopResult<()> {
        self.state.lock().unwrap().fds.remove(&fd.0);
        Ok(())
    }
}

fn apply_setattr(attr: &mut FileAttr, attrs: &SetAttrs) {
    if let Some(mode) = attrs.mode {
        attr.perm = mode;
    }
    if let Some(uid) = attrs.uid {
        attr.uid = uid;
    }
    if let Some(gid) = attrs.gid {
        attr.gid = gid;
    }
    if let Some(atime) = attrs.atime {
        attr.atime = atime;
    }
    if let Some(mtime) = attrs.mtime {
        attr.mtime = mtime;
    }
    attr.ctime = SystemTime::now();
}

impl MemBrick {
    async fn list_dir(
        &self,
        fd: Fd,
        offset: u64,
        count: usize,
        xattr_req: Option<&Xattrs>,
    ) -> FopResult<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        let gfid = *state.fds.get(&fd.0).ok_or(Errno::EINVAL)?;
        let dir = state.entries.get(&gfid).ok_or(Errno::ENOTDIR)?;

        let mut out = Vec::new();
        for (i, (name, child)) in dir.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if out.len() >= count {
                break;
            }
            let node = match state.nodes.get(child) {
                Some(node) => node,
                None => continue,
            };
            let xattrs = match xattr_req {
                Some(req) => state.requested_xattrs(node, *child, req),
                None => Xattrs::new(),
            };
            out.push(DirEntry {
                name: name.clone(),
                kind: node.attr.kind,
                offset: i as u64 + 1,
                attr: xattr_req.map(|_| node.attr),
                xattrs,
            });
        }
        Ok(out)
    }

    // ---- test-side inspection and seeding helpers ----

    pub fn has_path(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.resolve_path(path).is_some()
    }

    pub fn attr_of(&self, path: &str) -> Option<FileAttr> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve_path(path)?;
        Some(state.nodes.get(&gfid)?.attr)
    }

    pub fn xattrs_of(&self, path: &str) -> Option<Xattrs> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve_path(path)?;
        Some(state.nodes.get(&gfid)?.xattrs.clone())
    }

    pub fn data_of(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let gfid = state.resolve_path(path)?;
        Some(state.nodes.get(&gfid)?.data.clone())
    }

    /// Drop a file directly, bypassing the cluster (simulates manual
    /// damage on a brick).
    pub fn destroy_path(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let components = path_components(path);
        let Some(&name) = components.last() else {
            return;
        };
        let mut parent = Gfid::ROOT;
        for component in &components[..components.len() - 1] {
            parent = match state.entries.get(&parent).and_then(|d| d.get(*component)) {
                Some(g) => *g,
                None => return,
            };
        }
        if let Some(gfid) = state.entries.get_mut(&parent).and_then(|d| d.remove(name)) {
            state.nodes.remove(&gfid);
            state.entries.remove(&gfid);
        }
    }

    /// Seed a regular file under the root, as if it had always been here.
    pub fn plant_file(&self, name: &str, gfid: Gfid, data: &[u8], perm: u16) {
        let mut state = self.state.lock().unwrap();
        let mut node = Node::new(gfid, FileType::RegularFile, perm);
        node.data = data.to_vec();
        node.refresh_size();
        state.nodes.insert(gfid, node);
        state
            .entries
            .get_mut(&Gfid::ROOT)
            .unwrap()
            .insert(name.to_owned(), gfid);
    }

    /// Seed a pointer file under the root.
    pub fn plant_linkfile(&self, name: &str, gfid: Gfid, target: &str, link_key: &str) {
        let mut state = self.state.lock().unwrap();
        let mut node = Node::new(gfid, FileType::RegularFile, scatterfs::LINKFILE_MODE);
        node.xattrs.set_str(link_key, target);
        state.nodes.insert(gfid, node);
        state
            .entries
            .get_mut(&Gfid::ROOT)
            .unwrap()
            .insert(name.to_owned(), gfid);
    }

    /// Seed a directory under the root.
    pub fn plant_dir(&self, name: &str, gfid: Gfid) {
        let mut state = self.state.lock().unwrap();
        let node = Node::new(gfid, FileType::Directory, 0o755);
        state.nodes.insert(gfid, node);
        state.entries.insert(gfid, BTreeMap::new());
        state
            .entries
            .get_mut(&Gfid::ROOT)
            .unwrap()
            .insert(name.to_owned(), gfid);
    }
}

pub struct TestCluster {
    pub dist: Arc<Distribute>,
    pub bricks: Vec<Arc<MemBrick>>,
    pub subvols: Vec<SubvolRef>,
}

impl TestCluster {
    /// The brick a name currently hashes to under the root layout.
    pub fn hashed_brick(&self, name: &str) -> Arc<MemBrick> {
        let layout = self.dist.layout_get(Gfid::ROOT).expect("root layout");
        let hit = layout
            .search_hash(scatterfs::hash_name(name))
            .expect("hashed subvol");
        self.brick_named(hit.name())
    }

    pub fn brick_named(&self, name: &str) -> Arc<MemBrick> {
        self.bricks
            .iter()
            .find(|b| b.name() == name)
            .expect("brick by name")
            .clone()
    }

    /// Bricks other than `name`, in order.
    pub fn other_bricks(&self, name: &str) -> Vec<Arc<MemBrick>> {
        self.bricks
            .iter()
            .filter(|b| b.name() != name)
            .cloned()
            .collect()
    }

    pub fn root_loc(&self) -> Loc {
        Loc::root()
    }

    pub fn child_loc(&self, name: &str) -> Loc {
        Loc::child(&Loc::root(), name)
    }
}

/// Build an `n`-brick cluster, mark every brick up, and look the root up
/// once so its layout exists.
pub async fn cluster(n: usize) -> TestCluster {
    cluster_with_options(n, Options::default()).await
}

pub async fn cluster_with_options(n: usize, options: Options) -> TestCluster {
    let _ = env_logger::builder().is_test(true).try_init();

    let bricks: Vec<Arc<MemBrick>> = (0..n).map(|i| MemBrick::new(&format!("brick-{i}"))).collect();
    let subvols: Vec<SubvolRef> = bricks.iter().map(|b| b.clone() as SubvolRef).collect();
    let dist = Distribute::new("testvol", subvols.clone(), options).expect("cluster");

    for subvol in &subvols {
        dist.notify(subvol, ChildEvent::Up);
    }

    dist.lookup(&Loc::root(), &Xattrs::new())
        .await
        .expect("root lookup");

    TestCluster {
        dist,
        bricks,
        subvols,
    }
}
