use tokio::io::AsyncWriteExt;

use ferry_core::message::{LISTING_HEADING, NO_FILES_MESSAGE};
use ferry_core::Message;
use ferryd::ShareSummary;

use crate::*;

#[tokio::test]
async fn empty_directory_lists_no_files() {
    let (dir, _task, addr) = start_directory("dir-empty").await;
    let client = start_client("dir-empty-client", &addr).await;

    client.list().await.unwrap();
    assert_eq!(next_text(&client).await, NO_FILES_MESSAGE);

    stop(&[client.node(), &dir]).await;
}

#[tokio::test]
async fn added_files_appear_in_listing() {
    let (dir, _task, addr) = start_directory("dir-add").await;
    let share = scratch_dir("dir-add-share");
    std::fs::write(share.join("alpha.txt"), vec![b'a'; 12]).unwrap();
    std::fs::write(share.join("beta.bin"), vec![0u8; 3000]).unwrap();

    let owner = start_client("dir-add-owner", &addr).await;
    let shared = owner.share(&[share.clone()]).await.unwrap();
    assert_eq!(shared, ShareSummary { files: 2, messages: 1 });
    assert_eq!(
        next_text(&owner).await,
        "2 files successfully added to file listing."
    );

    owner.list().await.unwrap();
    let listing = next_text(&owner).await;
    assert!(listing.starts_with(LISTING_HEADING), "listing: {listing:?}");
    let entries: Vec<_> = listing
        .lines()
        .filter(|line| line.starts_with('\t'))
        .collect();
    assert_eq!(entries, vec!["\t1) alpha.txt - (12 B)", "\t2) beta.bin - (3000 B)"]);

    stop(&[owner.node(), &dir]).await;
}

#[tokio::test]
async fn unknown_file_resolves_to_null() {
    let (dir, _task, addr) = start_directory("dir-null").await;
    let client = start_client("dir-null-client", &addr).await;

    client.request_file(42).await.unwrap();
    let reply = next_text(&client).await;
    assert_eq!(Message::parse(&reply).unwrap(), Message::FileAddress(None));
    assert_eq!(reply, "fileAddress\r\nNULL\r\nNULL");

    stop(&[client.node(), &dir]).await;
}

#[tokio::test]
async fn known_file_resolves_to_owner_address() {
    let (dir, _task, addr) = start_directory("dir-known").await;
    let share = scratch_dir("dir-known-share");
    std::fs::write(share.join("notes.md"), b"# notes\n").unwrap();

    let owner = start_client("dir-known-owner", &addr).await;
    owner.share(&[share.join("notes.md")]).await.unwrap();
    next_text(&owner).await;

    // Raw getFile, so the requester's node does not start fetching.
    let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
    raw.write_all(b"getFile\r\n1\0").await.unwrap();
    let reply = read_message(&mut raw).await.unwrap();

    assert_eq!(
        reply,
        format!(
            "fileAddress\r\n1\r\n127.0.0.1:{}\r\nnotes.md\r\n8",
            owner.node().public_port()
        )
    );

    stop(&[owner.node(), &dir]).await;
}

#[tokio::test]
async fn files_are_unlisted_when_owner_disconnects() {
    let (dir, _task, addr) = start_directory("dir-prune").await;
    let share = scratch_dir("dir-prune-share");
    std::fs::write(share.join("gone.txt"), b"bye").unwrap();

    let owner = start_client("dir-prune-owner", &addr).await;
    owner.share(&[share.join("gone.txt")]).await.unwrap();
    next_text(&owner).await;

    let watcher = start_client("dir-prune-watcher", &addr).await;
    watcher.list().await.unwrap();
    assert!(next_text(&watcher).await.contains("gone.txt"));

    assert!(owner.node().close(owner.socket_id()));

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        watcher.list().await.unwrap();
        if next_text(&watcher).await == NO_FILES_MESSAGE {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "file still listed after owner left"
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    stop(&[owner.node(), watcher.node(), &dir]).await;
}

#[tokio::test]
async fn large_share_is_split_and_fully_listed() {
    let (dir, _task, addr) = start_directory("dir-bulk").await;
    let share = scratch_dir("dir-bulk-share");
    for i in 0..400 {
        let name = format!("{}-{i:03}.txt", "n".repeat(116));
        std::fs::write(share.join(name), b"x").unwrap();
    }

    let owner = start_client("dir-bulk-owner", &addr).await;
    let shared = owner.share(&[share.clone()]).await.unwrap();
    assert_eq!(shared.files, 400);
    assert!(shared.messages > 1, "400 long offers fit one message?");

    let mut acknowledged = 0;
    for _ in 0..shared.messages {
        let reply = next_text(&owner).await;
        let count: usize = reply
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| panic!("unexpected reply {reply:?}"));
        acknowledged += count;
    }
    assert_eq!(acknowledged, 400);

    owner.list().await.unwrap();
    let listing = next_text(&owner).await;
    let entries = listing.lines().filter(|line| line.starts_with('\t')).count();
    assert_eq!(entries, 400);
    assert!(owner.node().table().contains(owner.socket_id()));

    stop(&[owner.node(), &dir]).await;
}

#[tokio::test]
async fn client_that_never_reads_does_not_stall_others() {
    let (dir, _task, addr) = start_directory("dir-stall").await;
    let share = scratch_dir("dir-stall-share");
    for i in 0..150 {
        std::fs::write(share.join(format!("shared-file-{i:03}.dat")), b"data").unwrap();
    }
    let owner = start_client("dir-stall-owner", &addr).await;
    let shared = owner.share(&[share.clone()]).await.unwrap();
    for _ in 0..shared.messages {
        next_text(&owner).await;
    }

    // Floods `list` and never reads a reply. Once the directory gives up on
    // it this write may never finish, so it runs on its own task.
    let mut hog = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let flood = b"list\0".repeat(2000);
    let hog_task = tokio::spawn(async move {
        let _ = hog.write_all(&flood).await;
        hog
    });
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let other = start_client("dir-stall-other", &addr).await;
    other.list().await.unwrap();
    let listing = next_text(&other).await;
    assert!(listing.starts_with(LISTING_HEADING), "listing: {listing:?}");
    assert_eq!(listing.lines().filter(|line| line.starts_with('\t')).count(), 150);

    hog_task.abort();
    stop(&[owner.node(), other.node(), &dir]).await;
}
