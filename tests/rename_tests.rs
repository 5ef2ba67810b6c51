//! The rename protocol, within and across subvolumes.

mod util;

use std::sync::Arc;

use scatterfs::{AccessMode, Errno, LINKFILE_MODE, Loc, OpenFlags, Subvolume, Xattrs};
use util::{MemBrick, TestCluster, cluster};

const LINK_KEY: &str = "trusted.glusterfs.dht.linkto";

async fn create_file(c: &TestCluster, name: &str, data: &[u8]) -> Loc {
    let loc = c.child_loc(name);
    let created = c
        .dist
        .create(&loc, AccessMode::ReadWrite, OpenFlags::empty(), 0o644, &Xattrs::new())
        .await
        .unwrap();
    if !data.is_empty() {
        c.dist.writev(created.fd, data, 0).await.unwrap();
    }
    c.dist.release(created.fd).await.unwrap();
    let mut loc = loc;
    loc.gfid = created.entry.attr.gfid;
    loc
}

/// Two names whose hashed bricks differ (or match, per `want_same`).
fn name_pair(c: &TestCluster, want_same: bool) -> (String, String) {
    let candidates: Vec<String> = (0..64).map(|i| format!("name-{i}")).collect();
    let first = &candidates[0];
    let first_brick = c.hashed_brick(first);
    for other in &candidates[1..] {
        let same = c.hashed_brick(other).name() == first_brick.name();
        if same == want_same {
            return (first.clone(), other.clone());
        }
    }
    panic!("no suitable name pair found");
}

fn bricks_holding(c: &TestCluster, path: &str) -> Vec<Arc<MemBrick>> {
    c.bricks.iter().filter(|b| b.has_path(path)).cloned().collect()
}

#[tokio::test]
async fn rename_across_hash_boundaries_leaves_a_pointer() {
    let c = cluster(3).await;
    let (src_name, dst_name) = name_pair(&c, false);

    let src = create_file(&c, &src_name, b"content").await;
    let gfid = src.gfid;
    let data_brick = c.hashed_brick(&src_name);
    let dst_hashed = c.hashed_brick(&dst_name);

    let dst = c.child_loc(&dst_name);
    c.dist.rename(&src, &dst).await.unwrap();

    // the old name resolves nowhere
    let err = c
        .dist
        .lookup(&c.child_loc(&src_name), &Xattrs::new())
        .await
        .unwrap_err();
    assert_eq!(err, Errno::ENOENT);
    for brick in &c.bricks {
        assert!(!brick.has_path(&format!("/{src_name}")));
    }

    // the data was renamed in place on its own brick
    let moved = data_brick.attr_of(&format!("/{dst_name}")).expect("data file");
    assert_eq!(moved.gfid, gfid);
    assert_eq!(data_brick.data_of(&format!("/{dst_name}")).unwrap(), b"content");

    // the new name's hashed brick carries a pointer at the data
    let pointer = dst_hashed.attr_of(&format!("/{dst_name}")).expect("pointer");
    assert_eq!(pointer.perm, LINKFILE_MODE);
    let xattrs = dst_hashed.xattrs_of(&format!("/{dst_name}")).unwrap();
    assert_eq!(xattrs.get_str(LINK_KEY), Some(data_brick.name()));

    // and the whole thing resolves with the identity preserved
    let reply = c
        .dist
        .lookup(&c.child_loc(&dst_name), &Xattrs::new())
        .await
        .unwrap();
    assert_eq!(reply.attr.gfid, gfid);
}

#[tokio::test]
async fn rename_within_one_brick_is_plain() {
    let c = cluster(3).await;
    let (src_name, dst_name) = name_pair(&c, true);

    let src = create_file(&c, &src_name, b"x").await;
    let gfid = src.gfid;
    let brick = c.hashed_brick(&src_name);

    c.dist.rename(&src, &c.child_loc(&dst_name)).await.unwrap();

    assert!(!brick.has_path(&format!("/{src_name}")));
    let moved = brick.attr_of(&format!("/{dst_name}")).unwrap();
    assert_eq!(moved.gfid, gfid);
    assert_ne!(moved.perm, LINKFILE_MODE);

    // no pointer anywhere: source and destination hash identically
    assert_eq!(bricks_holding(&c, &format!("/{dst_name}")).len(), 1);
}

#[tokio::test]
async fn rename_replaces_an_existing_destination() {
    let c = cluster(3).await;
    let (src_name, dst_name) = name_pair(&c, false);

    let src = create_file(&c, &src_name, b"new").await;
    let dst_existing = create_file(&c, &dst_name, b"old").await;
    assert_ne!(src.gfid, dst_existing.gfid);

    let mut dst = c.child_loc(&dst_name);
    dst.gfid = dst_existing.gfid;
    c.dist.rename(&src, &dst).await.unwrap();

    let reply = c
        .dist
        .lookup(&c.child_loc(&dst_name), &Xattrs::new())
        .await
        .unwrap();
    assert_eq!(reply.attr.gfid, src.gfid, "destination must now be the renamed file");

    // the displaced file's data is gone
    for brick in &c.bricks {
        if let Some(attr) = brick.attr_of(&format!("/{dst_name}")) {
            assert_ne!(attr.gfid, dst_existing.gfid);
        }
    }
}

#[tokio::test]
async fn directory_rename_hits_every_brick() {
    let c = cluster(3).await;
    c.dist
        .mkdir(&c.child_loc("olddir"), 0o755, &Xattrs::new())
        .await
        .unwrap();

    let reply = c
        .dist
        .lookup(&c.child_loc("olddir"), &Xattrs::new())
        .await
        .unwrap();
    let mut src = c.child_loc("olddir");
    src.gfid = reply.attr.gfid;

    c.dist.rename(&src, &c.child_loc("newdir")).await.unwrap();

    for brick in &c.bricks {
        assert!(!brick.has_path("/olddir"), "stale copy on {}", brick.name());
        assert!(brick.has_path("/newdir"), "missing copy on {}", brick.name());
    }
}
