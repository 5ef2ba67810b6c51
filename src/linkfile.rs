//! Pointer files ("linkto" files).
//!
//! When a file's data does not live on the subvolume its name hashes to, a
//! zero-length file with link-file mode and a `...linkto` xattr sits on the
//! hashed subvolume and redirects lookups to the data. This module creates,
//! resolves and reaps those pointers.

use log::{debug, error, warn};

use crate::cluster::Distribute;
use crate::errno::{Errno, FopResult};
use crate::subvol::{
    EntryReply, GFID_REQ_KEY, INTERNAL_FOP_KEY, OPEN_FD_COUNT_KEY, SetAttrs, SubvolRef,
};
use crate::types::{FileAttr, FileType, Gfid, LINKFILE_MODE, Loc, Xattrs};

/// A file is a pointer iff its mode is exactly the link-file mode *and*
/// the linkto xattr is present. Either alone is not enough: sticky-only
/// mode also marks migration phase 2, and a plain file may carry stray
/// xattrs.
pub(crate) fn is_linkfile(attr: &FileAttr, xattrs: &Xattrs, link_key: &str) -> bool {
    attr.has_linkfile_mode() && xattrs.contains(link_key)
}

/// Resolve a pointer to its target subvolume by name. `None` when the
/// xattr is missing or names a subvolume this cluster does not have.
pub(crate) fn linkfile_subvol(
    dist: &Distribute,
    xattrs: &Xattrs,
    link_key: &str,
) -> Option<SubvolRef> {
    let target = xattrs.get_str(link_key)?;
    dist.subvol_by_name(target)
}

/// The brick-maintained open-fd count, when the lookup requested it.
pub(crate) fn open_fd_count(xattrs: &Xattrs) -> Option<u64> {
    let raw = xattrs.get(OPEN_FD_COUNT_KEY)?;
    match raw.len() {
        4 => Some(u64::from(u32::from_be_bytes(raw.try_into().ok()?))),
        8 => Some(u64::from_be_bytes(raw.try_into().ok()?)),
        _ => None,
    }
}

/// A pointer may be reaped only when nothing has it open and its target
/// claim is known to be wrong.
pub(crate) fn stale_link_removable(xattrs: &Xattrs) -> bool {
    open_fd_count(xattrs) == Some(0)
}

/// Create a pointer on `from` redirecting `loc` to `to`.
///
/// The pointer is created as the superuser; ownership of the real file is
/// healed afterwards, best-effort. An `EEXIST` collision is fine as long
/// as the existing file is itself a pointer.
pub(crate) async fn linkfile_create(
    dist: &Distribute,
    to: &SubvolRef,
    from: &SubvolRef,
    loc: &Loc,
    gfid: Gfid,
) -> FopResult<EntryReply> {
    let link_key = dist.link_xattr_name();

    let mut xattrs = Xattrs::new();
    if !gfid.is_null() {
        xattrs.set(GFID_REQ_KEY, gfid.0.to_vec());
    }
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");
    xattrs.set_str(&link_key, to.name());

    match from
        .mknod(loc, FileType::RegularFile, LINKFILE_MODE, 0, &xattrs)
        .await
    {
        Ok(entry) => Ok(entry),
        Err(err) if err == Errno::EEXIST => {
            // somebody else raced us here; accept the collision only if
            // what exists is a pointer too
            let mut req = Xattrs::new();
            req.set(&link_key, Vec::new());
            let reply = from.lookup(loc, &req).await?;
            if !is_linkfile(&reply.attr, &reply.xattrs, &link_key) {
                warn!(
                    "data file found on {} where linkto file was expected, path {}",
                    from.name(),
                    loc.path
                );
                return Err(Errno::EEXIST);
            }
            Ok(EntryReply {
                attr: reply.attr,
                preparent: reply.postparent.unwrap_or_default(),
                postparent: reply.postparent.unwrap_or_default(),
            })
        }
        Err(err) => Err(err),
    }
}

/// Restore the pointer's ownership to the real file's owner. The pointer
/// was created as root; a failure here is logged and swallowed.
pub(crate) async fn linkfile_attr_heal(subvol: &SubvolRef, loc: &Loc, attr: &FileAttr) {
    if let Err(err) = subvol
        .setattr(loc, &SetAttrs::owner(attr.uid, attr.gid))
        .await
    {
        error!(
            "setattr of uid/gid on {} failed on {}: {err}",
            loc.path,
            subvol.name()
        );
    }
}

/// Remove a pointer, marking the operation internal so the brick stack
/// does not account it to the user.
pub(crate) async fn linkfile_unlink(
    _dist: &Distribute,
    subvol: &SubvolRef,
    loc: &Loc,
) -> FopResult<()> {
    debug!("unlinking linkfile {} on {}", loc.path, subvol.name());
    let mut xattrs = Xattrs::new();
    xattrs.set_str(INTERNAL_FOP_KEY, "yes");
    subvol.unlink(loc, &xattrs).await.map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;

    const LINK_KEY: &str = "trusted.glusterfs.dht.linkto";

    #[test]
    fn linkfile_needs_mode_and_xattr() {
        let mut attr = FileAttr {
            kind: FileType::RegularFile,
            perm: LINKFILE_MODE,
            ..FileAttr::default()
        };
        let mut xattrs = Xattrs::new();
        assert!(!is_linkfile(&attr, &xattrs, LINK_KEY));

        xattrs.set_str(LINK_KEY, "brick-2");
        assert!(is_linkfile(&attr, &xattrs, LINK_KEY));

        attr.perm = 0o644;
        assert!(!is_linkfile(&attr, &xattrs, LINK_KEY));

        attr.perm = LINKFILE_MODE;
        attr.kind = FileType::Directory;
        assert!(!is_linkfile(&attr, &xattrs, LINK_KEY));
    }

    #[test]
    fn open_fd_count_accepts_both_widths() {
        let mut xattrs = Xattrs::new();
        xattrs.set(OPEN_FD_COUNT_KEY, 0u32.to_be_bytes().to_vec());
        assert_eq!(open_fd_count(&xattrs), Some(0));
        assert!(stale_link_removable(&xattrs));

        xattrs.set(OPEN_FD_COUNT_KEY, 3u64.to_be_bytes().to_vec());
        assert_eq!(open_fd_count(&xattrs), Some(3));
        assert!(!stale_link_removable(&xattrs));

        xattrs.set(OPEN_FD_COUNT_KEY, vec![1, 2, 3]);
        assert_eq!(open_fd_count(&xattrs), None);
        assert!(!stale_link_removable(&xattrs));
    }
}
